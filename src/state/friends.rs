//! Friendship graph and pending friend requests
//!
//! The friend graph is an adjacency map keyed by username; each edge
//! carries the pair's shared conversation id and a cached presence
//! status. Friendship is symmetric: both endpoints list the other with
//! the same `conv`.

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::presence::PresenceStatus;
use crate::current_timestamp;

/// One edge of the friend graph as seen from its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendEntry {
    /// The friend's username
    pub name: String,
    /// Cached presence, refreshed on login/logout; user-facing responses
    /// prefer a live lookup of the online map
    pub status: PresenceStatus,
    /// Conversation id shared by the pair
    pub conv: String,
}

/// Friendships plus the pending-request queue, each under its own lock
pub struct FriendTable {
    /// username -> friend entries
    friends: RwLock<HashMap<String, Vec<FriendEntry>>>,
    /// target -> ordered senders awaiting confirmation
    pending: RwLock<HashMap<String, Vec<String>>>,
}

impl FriendTable {
    pub fn new() -> Self {
        Self {
            friends: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Queue a friend request; idempotent per (target, sender) pair
    pub async fn add_pending(&self, target: &str, sender: &str) {
        let mut pending = self.pending.write().await;
        let queue = pending.entry(target.to_string()).or_default();
        if !queue.iter().any(|s| s == sender) {
            queue.push(sender.to_string());
        }
    }

    /// Remove a pending request, returning whether it existed
    pub async fn take_pending(&self, target: &str, sender: &str) -> bool {
        let mut pending = self.pending.write().await;
        let Some(queue) = pending.get_mut(target) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|s| s == sender) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            pending.remove(target);
        }
        true
    }

    /// The conversation id shared by two users, looked up from either
    /// endpoint's list
    pub async fn conversation_id(&self, a: &str, b: &str) -> Option<String> {
        let friends = self.friends.read().await;
        let from = |owner: &str, other: &str| -> Option<String> {
            friends
                .get(owner)?
                .iter()
                .find(|e| e.name == other && !e.conv.is_empty())
                .map(|e| e.conv.clone())
        };
        from(a, b).or_else(|| from(b, a))
    }

    /// Record a confirmed friendship both ways, reusing any conversation
    /// id already present on either side or minting a fresh one.
    /// Returns the pair's conversation id.
    pub async fn confirm(
        &self,
        user: &str,
        sender: &str,
        user_status: PresenceStatus,
        sender_status: PresenceStatus,
    ) -> String {
        let mut friends = self.friends.write().await;

        let existing = |owner: &str, other: &str, map: &HashMap<String, Vec<FriendEntry>>| {
            map.get(owner)
                .and_then(|list| list.iter().find(|e| e.name == other && !e.conv.is_empty()))
                .map(|e| e.conv.clone())
        };
        let conv = existing(user, sender, &friends)
            .or_else(|| existing(sender, user, &friends))
            .unwrap_or_else(|| format!("U{}-{}", current_timestamp(), rand::random::<u16>()));

        let upsert = |list: &mut Vec<FriendEntry>, name: &str, status: PresenceStatus, conv: &str| {
            for entry in list.iter_mut() {
                if entry.name == name {
                    entry.status = status;
                    entry.conv = conv.to_string();
                    return;
                }
            }
            list.push(FriendEntry {
                name: name.to_string(),
                status,
                conv: conv.to_string(),
            });
        };

        upsert(friends.entry(user.to_string()).or_default(), sender, sender_status, &conv);
        upsert(friends.entry(sender.to_string()).or_default(), user, user_status, &conv);

        conv
    }

    /// The user's friend list
    pub async fn friends_of(&self, user: &str) -> Vec<FriendEntry> {
        self.friends
            .read()
            .await
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    /// Update the cached status for every entry naming `user`
    pub async fn set_status(&self, user: &str, status: PresenceStatus) {
        let mut friends = self.friends.write().await;
        for list in friends.values_mut() {
            for entry in list.iter_mut() {
                if entry.name == user {
                    entry.status = status;
                }
            }
        }
    }

    /// Copy of the friend graph for persistence
    pub async fn snapshot(&self) -> HashMap<String, Vec<FriendEntry>> {
        self.friends.read().await.clone()
    }

    /// Copy of the pending queues for persistence
    pub async fn snapshot_pending(&self) -> HashMap<String, Vec<String>> {
        self.pending.read().await.clone()
    }

    /// Replace the friend graph (startup load)
    pub async fn load(&self, entries: HashMap<String, Vec<FriendEntry>>) {
        *self.friends.write().await = entries;
    }

    /// Replace the pending queues (startup load)
    pub async fn load_pending(&self, entries: HashMap<String, Vec<String>>) {
        *self.pending.write().await = entries;
    }
}

impl Default for FriendTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_request_idempotent() {
        let table = FriendTable::new();
        table.add_pending("bob", "alice").await;
        table.add_pending("bob", "alice").await;

        assert!(table.take_pending("bob", "alice").await);
        // The second add did not create a duplicate
        assert!(!table.take_pending("bob", "alice").await);
    }

    #[tokio::test]
    async fn test_confirm_is_symmetric_with_shared_conv() {
        let table = FriendTable::new();
        let conv = table
            .confirm("bob", "alice", PresenceStatus::Online, PresenceStatus::Online)
            .await;

        let bobs = table.friends_of("bob").await;
        let alices = table.friends_of("alice").await;
        assert_eq!(bobs.len(), 1);
        assert_eq!(alices.len(), 1);
        assert_eq!(bobs[0].name, "alice");
        assert_eq!(alices[0].name, "bob");
        assert_eq!(bobs[0].conv, conv);
        assert_eq!(alices[0].conv, conv);

        assert_eq!(table.conversation_id("alice", "bob").await.as_deref(), Some(conv.as_str()));
        assert_eq!(table.conversation_id("bob", "alice").await.as_deref(), Some(conv.as_str()));
    }

    #[tokio::test]
    async fn test_confirm_reuses_existing_conv() {
        let table = FriendTable::new();
        let first = table
            .confirm("bob", "alice", PresenceStatus::Offline, PresenceStatus::Offline)
            .await;
        let second = table
            .confirm("alice", "bob", PresenceStatus::Online, PresenceStatus::Online)
            .await;
        assert_eq!(first, second);
        assert_eq!(table.friends_of("bob").await.len(), 1);
    }

    #[tokio::test]
    async fn test_set_status_touches_every_occurrence() {
        let table = FriendTable::new();
        table
            .confirm("bob", "alice", PresenceStatus::Online, PresenceStatus::Online)
            .await;
        table
            .confirm("carol", "alice", PresenceStatus::Online, PresenceStatus::Online)
            .await;

        table.set_status("alice", PresenceStatus::Offline).await;

        for owner in ["bob", "carol"] {
            let entry = &table.friends_of(owner).await[0];
            assert_eq!(entry.name, "alice");
            assert_eq!(entry.status, PresenceStatus::Offline);
        }
    }

    #[tokio::test]
    async fn test_conversation_id_missing_for_strangers() {
        let table = FriendTable::new();
        assert!(table.conversation_id("alice", "bob").await.is_none());
    }
}
