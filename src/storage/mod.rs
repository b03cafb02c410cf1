//! Flat-file persistence
//!
//! All durable state lives in a data directory of line-oriented UTF-8
//! text files (one record per line, trailing `\r` tolerated):
//!
//! - `users.txt` — `username:password`
//! - `sessions.txt` — `session_id:username`
//! - `friends.txt` — `user:entry1,entry2,…` with entry `name|status|conv`
//! - `pending_requests.txt` — `target:sender1,sender2,…`
//! - `groups.txt` — `group:creator:max:member1,member2,…`
//! - `group_invites.txt` — `group:invitee1,invitee2,…`
//! - `file_metadata.txt` (append-only) —
//!   `fid|filename|sender|type|target|size|path|time`
//! - `messages/U_<conv>.txt`, `messages/G_<group>.txt` (append-only) —
//!   history lines `ts|sender|kind|content`
//! - `files/U_<conv>.txt`, `files/G_<group>.txt` (append-only) — file
//!   event index, same grammar
//! - `uploads/<fid>` — raw file blobs
//!
//! Tabular files are rewritten whole on mutation; logs append in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{ChatError, Result};
use crate::history::MessageRecord;
use crate::protocol::Scope;
use crate::state::{FileMetadata, FriendEntry, Group, PresenceStatus};

/// Key of a per-conversation log: 1:1 conversations by conversation id,
/// groups by group name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogKey {
    Direct(String),
    Group(String),
}

impl LogKey {
    fn file_name(&self) -> String {
        match self {
            LogKey::Direct(conv) => format!("U_{}.txt", conv),
            LogKey::Group(name) => format!("G_{}.txt", name),
        }
    }
}

/// Persistence store rooted at a data directory
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory layout and touch the tabular files so a
    /// fresh data directory loads cleanly
    pub async fn ensure_layout(&self) -> Result<()> {
        for dir in ["messages", "files", "uploads"] {
            fs::create_dir_all(self.root.join(dir))
                .await
                .map_err(|e| ChatError::storage(format!("create {}: {}", dir, e)))?;
        }
        for file in [
            "users.txt",
            "sessions.txt",
            "friends.txt",
            "pending_requests.txt",
            "groups.txt",
            "group_invites.txt",
            "file_metadata.txt",
        ] {
            let path = self.root.join(file);
            if fs::metadata(&path).await.is_err() {
                fs::write(&path, b"")
                    .await
                    .map_err(|e| ChatError::storage(format!("create {}: {}", file, e)))?;
            }
        }
        Ok(())
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Storage path of an upload blob
    pub fn upload_path(&self, file_id: &str) -> PathBuf {
        self.root.join("uploads").join(file_id)
    }

    /// Relative storage path recorded in file metadata
    pub fn upload_rel_path(&self, file_id: &str) -> String {
        format!("uploads/{}", file_id)
    }

    fn message_path(&self, key: &LogKey) -> PathBuf {
        self.root.join("messages").join(key.file_name())
    }

    fn index_path(&self, key: &LogKey) -> PathBuf {
        self.root.join("files").join(key.file_name())
    }

    async fn read_table(&self, name: &str) -> Result<String> {
        match fs::read_to_string(self.table_path(name)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(ChatError::storage(format!("read {}: {}", name, e))),
        }
    }

    async fn write_table(&self, name: &str, contents: String) -> Result<()> {
        fs::write(self.table_path(name), contents)
            .await
            .map_err(|e| ChatError::storage(format!("write {}: {}", name, e)))
    }

    async fn append_line(&self, path: &Path, line: String) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| ChatError::storage(format!("open {}: {}", path.display(), e)))?;
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| ChatError::storage(format!("append {}: {}", path.display(), e)))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tabular files
    // ------------------------------------------------------------------

    pub async fn load_users(&self) -> Result<HashMap<String, String>> {
        Ok(parse_users(&self.read_table("users.txt").await?))
    }

    pub async fn save_users(&self, users: &HashMap<String, String>) -> Result<()> {
        self.write_table("users.txt", render_users(users)).await
    }

    pub async fn load_sessions(&self) -> Result<Vec<(String, String)>> {
        Ok(parse_sessions(&self.read_table("sessions.txt").await?))
    }

    pub async fn save_sessions(&self, sessions: &[(String, String)]) -> Result<()> {
        self.write_table("sessions.txt", render_sessions(sessions))
            .await
    }

    pub async fn load_friends(&self) -> Result<HashMap<String, Vec<FriendEntry>>> {
        Ok(parse_friends(&self.read_table("friends.txt").await?))
    }

    pub async fn save_friends(&self, friends: &HashMap<String, Vec<FriendEntry>>) -> Result<()> {
        self.write_table("friends.txt", render_friends(friends))
            .await
    }

    pub async fn load_pending(&self) -> Result<HashMap<String, Vec<String>>> {
        Ok(parse_name_lists(
            &self.read_table("pending_requests.txt").await?,
        ))
    }

    pub async fn save_pending(&self, pending: &HashMap<String, Vec<String>>) -> Result<()> {
        self.write_table("pending_requests.txt", render_name_lists(pending))
            .await
    }

    pub async fn load_groups(&self) -> Result<HashMap<String, Group>> {
        Ok(parse_groups(&self.read_table("groups.txt").await?))
    }

    pub async fn save_groups(&self, groups: &HashMap<String, Group>) -> Result<()> {
        self.write_table("groups.txt", render_groups(groups)).await
    }

    pub async fn load_group_invites(&self) -> Result<HashMap<String, Vec<String>>> {
        Ok(parse_name_lists(
            &self.read_table("group_invites.txt").await?,
        ))
    }

    pub async fn save_group_invites(&self, invites: &HashMap<String, Vec<String>>) -> Result<()> {
        self.write_table("group_invites.txt", render_name_lists(invites))
            .await
    }

    /// Load completed-file metadata; entries on disk are complete by
    /// definition (active uploads are only ever in memory)
    pub async fn load_file_metadata(&self) -> Result<Vec<FileMetadata>> {
        Ok(parse_file_metadata(
            &self.read_table("file_metadata.txt").await?,
        ))
    }

    /// Record a completed upload; the metadata log is append-only
    pub async fn append_file_metadata(&self, meta: &FileMetadata) -> Result<()> {
        self.append_line(&self.table_path("file_metadata.txt"), render_file_metadata(meta))
            .await
    }

    // ------------------------------------------------------------------
    // Per-conversation logs
    // ------------------------------------------------------------------

    /// Append one record to a conversation's message log
    pub async fn append_message(&self, key: &LogKey, record: &MessageRecord) -> Result<()> {
        self.append_line(&self.message_path(key), record.to_line())
            .await
    }

    /// Append one record to a conversation's file-event index
    pub async fn append_file_event(&self, key: &LogKey, record: &MessageRecord) -> Result<()> {
        self.append_line(&self.index_path(key), record.to_line())
            .await
    }

    /// Read a conversation's message log in file (chronological) order;
    /// a missing log reads as empty
    pub async fn read_messages(&self, key: &LogKey) -> Result<Vec<MessageRecord>> {
        let text = match fs::read_to_string(self.message_path(key)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ChatError::storage(format!(
                    "read {}: {}",
                    key.file_name(),
                    e
                )))
            }
        };
        Ok(lines(&text).filter_map(MessageRecord::parse).collect())
    }
}

// ----------------------------------------------------------------------
// Record grammar helpers
// ----------------------------------------------------------------------

/// Iterate non-empty lines with `\r` and surrounding whitespace stripped
fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

/// Split at the first `:` into (key, rest)
fn split_kv(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(':')?;
    Some((line[..idx].trim(), line[idx + 1..].trim()))
}

fn parse_users(text: &str) -> HashMap<String, String> {
    lines(text)
        .filter_map(split_kv)
        .filter(|(user, _)| !user.is_empty())
        .map(|(user, pass)| (user.to_string(), pass.to_string()))
        .collect()
}

fn render_users(users: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (user, pass) in users {
        out.push_str(&format!("{}:{}\n", user, pass));
    }
    out
}

fn parse_sessions(text: &str) -> Vec<(String, String)> {
    lines(text)
        .filter_map(split_kv)
        .filter(|(sid, user)| !sid.is_empty() && !user.is_empty())
        .map(|(sid, user)| (sid.to_string(), user.to_string()))
        .collect()
}

fn render_sessions(sessions: &[(String, String)]) -> String {
    let mut out = String::new();
    for (sid, user) in sessions {
        out.push_str(&format!("{}:{}\n", sid, user));
    }
    out
}

fn parse_friend_entry(token: &str) -> Option<FriendEntry> {
    let mut parts = token.split('|');
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let status = PresenceStatus::parse(parts.next().unwrap_or("offline").trim());
    let conv = parts.next().unwrap_or("").trim().to_string();
    Some(FriendEntry {
        name: name.to_string(),
        status,
        conv,
    })
}

fn parse_friends(text: &str) -> HashMap<String, Vec<FriendEntry>> {
    lines(text)
        .filter_map(split_kv)
        .filter(|(user, _)| !user.is_empty())
        .map(|(user, rest)| {
            let entries = rest
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .filter_map(parse_friend_entry)
                .collect();
            (user.to_string(), entries)
        })
        .collect()
}

fn render_friends(friends: &HashMap<String, Vec<FriendEntry>>) -> String {
    let mut out = String::new();
    for (user, entries) in friends {
        let rendered: Vec<String> = entries
            .iter()
            .map(|e| format!("{}|{}|{}", e.name, e.status, e.conv))
            .collect();
        out.push_str(&format!("{}:{}\n", user, rendered.join(",")));
    }
    out
}

/// Shared grammar of `pending_requests.txt` and `group_invites.txt`:
/// `key:name1,name2,…`
fn parse_name_lists(text: &str) -> HashMap<String, Vec<String>> {
    lines(text)
        .filter_map(split_kv)
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, rest)| {
            let names = rest
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            (key.to_string(), names)
        })
        .collect()
}

fn render_name_lists(map: &HashMap<String, Vec<String>>) -> String {
    let mut out = String::new();
    for (key, names) in map {
        out.push_str(&format!("{}:{}\n", key, names.join(",")));
    }
    out
}

fn parse_groups(text: &str) -> HashMap<String, Group> {
    let mut groups = HashMap::new();
    for line in lines(text) {
        let parts: Vec<&str> = line.split(':').map(str::trim).collect();
        if parts.len() < 3 || parts[0].is_empty() {
            continue;
        }
        let Ok(max_members) = parts[2].parse::<u32>() else {
            continue;
        };
        let members = parts
            .get(3)
            .map(|rest| {
                rest.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        groups.insert(
            parts[0].to_string(),
            Group {
                name: parts[0].to_string(),
                creator: parts[1].to_string(),
                max_members,
                members,
            },
        );
    }
    groups
}

fn render_groups(groups: &HashMap<String, Group>) -> String {
    let mut out = String::new();
    for group in groups.values() {
        out.push_str(&format!(
            "{}:{}:{}:{}\n",
            group.name,
            group.creator,
            group.max_members,
            group.members.join(",")
        ));
    }
    out
}

fn parse_file_metadata(text: &str) -> Vec<FileMetadata> {
    let mut entries = Vec::new();
    for line in lines(text) {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 8 {
            continue;
        }
        let Some(scope) = Scope::parse(parts[3]) else {
            continue;
        };
        let (Ok(filesize), Ok(upload_time)) = (parts[5].parse::<u64>(), parts[7].parse::<i64>())
        else {
            continue;
        };
        entries.push(FileMetadata {
            unique_id: parts[0].to_string(),
            original_filename: parts[1].to_string(),
            sender: parts[2].to_string(),
            target_scope: scope,
            target_name: parts[4].to_string(),
            filesize,
            bytes_received: filesize,
            filepath: parts[6].to_string(),
            upload_complete: true,
            upload_time,
        });
    }
    entries
}

fn render_file_metadata(meta: &FileMetadata) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        meta.unique_id,
        meta.original_filename,
        meta.sender,
        meta.target_scope.tag(),
        meta.target_name,
        meta.filesize,
        meta.filepath,
        meta.upload_time
    )
}
