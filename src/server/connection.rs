//! Per-connection command dispatcher
//!
//! Each accepted socket runs one task that owns both stream halves. The
//! loop selects between the next request line and the connection's event
//! channel, through which other tasks deliver notifications and session
//! eviction. Commands are processed strictly in arrival order; binary
//! transfer phases borrow the same reader/writer between a status line
//! and the terminal status of that transfer.
//!
//! The handler is generic over the stream type so the full dispatch
//! surface can be exercised in tests over in-memory duplex pipes.

use std::sync::Arc;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::current_timestamp;
use crate::error::Result;
use crate::history::{select_range, MessageRecord, TimeRange};
use crate::protocol::response::notify;
use crate::protocol::{Command, Reply, Scope};
use crate::state::{
    Domain, EjectError, InviteError, JoinError, PeerEvent, PeerHandle, PresenceStatus,
};
use crate::storage::{LogKey, Store};

/// Session binding established by `LOGIN` or `AUTH`
struct Binding {
    session_id: String,
    username: String,
}

/// State of one client connection
pub struct Connection<S> {
    pub(super) client_id: u64,
    pub(super) domain: Arc<Domain>,
    pub(super) store: Arc<Store>,
    pub(super) lines: Lines<BufReader<ReadHalf<S>>>,
    pub(super) writer: WriteHalf<S>,
    events: UnboundedReceiver<PeerEvent>,
    handle: PeerHandle,
    session: Option<Binding>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Serve one connection to completion, then release its presence
    /// slot and refresh cached statuses
    pub async fn run(
        stream: S,
        client_id: u64,
        domain: Arc<Domain>,
        store: Arc<Store>,
    ) -> Result<()> {
        let (read_half, write_half) = tokio::io::split(stream);
        let (handle, events) = mpsc::unbounded_channel();

        let mut connection = Connection {
            client_id,
            domain,
            store,
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
            events,
            handle,
            session: None,
        };

        let result = connection.serve().await;
        connection.unbind().await;
        debug!(client = client_id, "connection closed");
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                line = self.lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.dispatch(line.trim()).await?,
                        Ok(None) => {
                            debug!(client = self.client_id, "peer closed connection");
                            break;
                        }
                        Err(e) => {
                            debug!(client = self.client_id, error = %e, "read failed");
                            break;
                        }
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(PeerEvent::Notify(message)) => {
                            self.send_line(&message).await?;
                        }
                        Some(PeerEvent::Expire(old_sid)) => {
                            info!(client = self.client_id, "session evicted by newer login");
                            let _ = self.send_line(&notify::session_expired(&old_sid)).await;
                            // The newer login already rebound presence and
                            // refreshed the cached statuses.
                            self.session = None;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Release this connection's binding: presence slot (only if still
    /// ours) and cached friend statuses
    async fn unbind(&mut self) {
        if let Some(binding) = self.session.take() {
            self.domain
                .presence
                .remove_if_same(&binding.username, &self.handle)
                .await;
            self.domain
                .friends
                .set_status(&binding.username, PresenceStatus::Offline)
                .await;
            self.persist_friends().await;
        }
    }

    async fn dispatch(&mut self, line: &str) -> Result<()> {
        // Blank lines are ignored silently
        if line.is_empty() {
            return Ok(());
        }
        debug!(client = self.client_id, request = line, "received");

        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(err) => return self.send_reply(Reply::from(err)).await,
        };

        if command.requires_auth() && self.session.is_none() {
            let reply = if matches!(command, Command::Logout) {
                Reply::fail(400, "NOT_LOGGED_IN")
            } else {
                Reply::unauthorized()
            };
            return self.send_reply(reply).await;
        }

        let reply = match command {
            Command::Register { username, password } => {
                self.handle_register(&username, &password).await
            }
            Command::Login { username, password } => self.handle_login(&username, &password).await,
            Command::Auth { session_id } => self.handle_auth(&session_id).await,
            Command::Logout => self.handle_logout().await,
            Command::AddFriend { target } => self.handle_add_friend(&target).await,
            Command::ConfirmFriend { sender } => self.handle_confirm_friend(&sender).await,
            Command::RejectFriend { sender } => self.handle_reject_friend(&sender).await,
            Command::GetFriends => self.handle_get_friends().await,
            Command::InitGroup { name, max_members } => {
                self.handle_init_group(&name, max_members).await
            }
            Command::SendInvite { group, target } => self.handle_send_invite(&group, &target).await,
            Command::ConfirmJoin { group } => self.handle_confirm_join(&group).await,
            Command::RejectJoin { group } => self.handle_reject_join(&group).await,
            Command::EjectUser { group, target } => self.handle_eject_user(&group, &target).await,
            Command::GetMembers { group } => self.handle_get_members(&group).await,
            Command::GetGroups => self.handle_get_groups().await,
            Command::Text {
                scope,
                target,
                content,
            } => self.handle_text(scope, &target, &content).await,
            Command::ReqUpload {
                scope,
                target,
                filename,
                filesize,
            } => {
                self.handle_req_upload(scope, &target, &filename, filesize)
                    .await
            }
            Command::ReqResumeUpload { file_id } => self.handle_resume_upload(&file_id).await,
            Command::ReqCancelUpload { file_id } => self.handle_cancel_upload(&file_id).await,
            Command::ReqCancelDownload { file_id } => self.handle_cancel_download(&file_id).await,

            // Streaming commands write their own status lines and body
            Command::History {
                scope,
                target,
                begin,
                end,
            } => return self.handle_history(scope, &target, &begin, &end).await,
            Command::UploadData { file_id } => return self.handle_upload_data(&file_id).await,
            Command::ReqDownload { file_id } => return self.handle_download(&file_id, None).await,
            Command::ReqResumeDownload { file_id, offset } => {
                return self.handle_download(&file_id, Some(offset)).await
            }
        };

        self.send_reply(reply).await
    }

    // ------------------------------------------------------------------
    // I/O helpers
    // ------------------------------------------------------------------

    pub(super) async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await?;
        Ok(())
    }

    pub(super) async fn send_reply(&mut self, reply: Reply) -> Result<()> {
        debug!(client = self.client_id, response = %reply, "sent");
        self.writer.write_all(reply.to_line().as_bytes()).await?;
        Ok(())
    }

    /// Username of the bound session; handlers behind the auth gate may
    /// rely on it being non-empty
    pub(super) fn username(&self) -> &str {
        self.session
            .as_ref()
            .map(|b| b.username.as_str())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Persistence helpers (best-effort; command replies do not depend on
    // these except where a handler checks explicitly)
    // ------------------------------------------------------------------

    async fn persist_users(&self) {
        let snapshot = self.domain.users.snapshot().await;
        if let Err(e) = self.store.save_users(&snapshot).await {
            warn!(client = self.client_id, error = %e, "failed to persist users");
        }
    }

    async fn persist_sessions(&self) {
        let snapshot = self.domain.sessions.snapshot().await;
        if let Err(e) = self.store.save_sessions(&snapshot).await {
            warn!(client = self.client_id, error = %e, "failed to persist sessions");
        }
    }

    async fn persist_friends(&self) {
        let snapshot = self.domain.friends.snapshot().await;
        if let Err(e) = self.store.save_friends(&snapshot).await {
            warn!(client = self.client_id, error = %e, "failed to persist friends");
        }
    }

    async fn persist_pending(&self) {
        let snapshot = self.domain.friends.snapshot_pending().await;
        if let Err(e) = self.store.save_pending(&snapshot).await {
            warn!(client = self.client_id, error = %e, "failed to persist pending requests");
        }
    }

    async fn persist_groups(&self) {
        let snapshot = self.domain.groups.snapshot().await;
        if let Err(e) = self.store.save_groups(&snapshot).await {
            warn!(client = self.client_id, error = %e, "failed to persist groups");
        }
    }

    async fn persist_invites(&self) {
        let snapshot = self.domain.groups.snapshot_invites().await;
        if let Err(e) = self.store.save_group_invites(&snapshot).await {
            warn!(client = self.client_id, error = %e, "failed to persist group invites");
        }
    }

    // ------------------------------------------------------------------
    // Accounts and sessions
    // ------------------------------------------------------------------

    async fn handle_register(&mut self, username: &str, password: &str) -> Reply {
        if !self.domain.users.register(username, password).await {
            return Reply::fail(409, "USER_EXISTS");
        }
        self.persist_users().await;
        info!(client = self.client_id, user = username, "registered");
        Reply::success(201, format!("REGISTERED {}", username))
    }

    async fn handle_login(&mut self, username: &str, password: &str) -> Reply {
        if !self.domain.users.verify(username, password).await {
            return Reply::fail(401, "INVALID_LOGIN");
        }

        // A connection logging in again first releases its old binding.
        self.unbind().await;

        // Single-active-session policy: the lock order here is fixed as
        // sessions, then online map, then friend statuses.
        let (session_id, evicted) = self.domain.sessions.create(username).await;
        if let Some(old_sid) = evicted {
            info!(client = self.client_id, user = username, "evicting previous session");
            if let Some(old_handle) = self.domain.presence.remove(username).await {
                let _ = old_handle.send(PeerEvent::Expire(old_sid));
            }
            self.domain
                .friends
                .set_status(username, PresenceStatus::Offline)
                .await;
            self.persist_friends().await;
        }
        self.persist_sessions().await;

        self.session = Some(Binding {
            session_id: session_id.clone(),
            username: username.to_string(),
        });
        self.domain
            .presence
            .insert(username, self.handle.clone())
            .await;
        self.domain
            .friends
            .set_status(username, PresenceStatus::Online)
            .await;
        self.persist_friends().await;

        info!(client = self.client_id, user = username, "logged in");
        Reply::success(200, format!("SESSION {}", session_id))
    }

    async fn handle_auth(&mut self, session_id: &str) -> Reply {
        let Some(username) = self.domain.sessions.resolve(session_id).await else {
            return Reply::fail(401, "SESSION_EXPIRED");
        };

        self.unbind().await;
        self.session = Some(Binding {
            session_id: session_id.to_string(),
            username: username.clone(),
        });
        self.domain
            .presence
            .insert(&username, self.handle.clone())
            .await;
        self.domain
            .friends
            .set_status(&username, PresenceStatus::Online)
            .await;
        self.persist_friends().await;

        info!(client = self.client_id, user = %username, "session rebound");
        Reply::success(200, "AUTH_OK")
    }

    async fn handle_logout(&mut self) -> Reply {
        let Some(binding) = self.session.take() else {
            return Reply::fail(400, "NOT_LOGGED_IN");
        };

        if self
            .domain
            .sessions
            .remove(&binding.session_id)
            .await
            .is_some()
        {
            self.persist_sessions().await;
        }
        self.domain
            .presence
            .remove_if_same(&binding.username, &self.handle)
            .await;
        self.domain
            .friends
            .set_status(&binding.username, PresenceStatus::Offline)
            .await;
        self.persist_friends().await;

        info!(client = self.client_id, user = %binding.username, "logged out");
        Reply::success(200, "LOGOUT")
    }

    // ------------------------------------------------------------------
    // Friendship
    // ------------------------------------------------------------------

    async fn handle_add_friend(&mut self, target: &str) -> Reply {
        let me = self.username().to_string();
        if !self.domain.users.contains(target).await {
            return Reply::fail(404, "USER_NOT_FOUND");
        }

        self.domain.friends.add_pending(target, &me).await;
        self.persist_pending().await;
        self.domain
            .presence
            .notify(target, notify::friend_request(&me))
            .await;
        Reply::success(200, format!("REQUEST_SENT {}", target))
    }

    async fn handle_confirm_friend(&mut self, sender: &str) -> Reply {
        let me = self.username().to_string();
        if !self.domain.friends.take_pending(&me, sender).await {
            return Reply::fail(404, "REQUEST_NOT_FOUND");
        }
        self.persist_pending().await;

        let my_status = self.domain.presence.status_of(&me).await;
        let sender_status = self.domain.presence.status_of(sender).await;
        self.domain
            .friends
            .confirm(&me, sender, my_status, sender_status)
            .await;
        self.persist_friends().await;

        self.domain
            .presence
            .notify(sender, notify::friend_accepted(&me))
            .await;
        Reply::success(201, format!("FRIEND_ADDED {}", sender))
    }

    async fn handle_reject_friend(&mut self, sender: &str) -> Reply {
        let me = self.username().to_string();
        if !self.domain.friends.take_pending(&me, sender).await {
            return Reply::fail(404, "REQUEST_NOT_FOUND");
        }
        self.persist_pending().await;

        self.domain
            .presence
            .notify(sender, notify::friend_rejected(&me))
            .await;
        Reply::success(200, format!("REJECTED_FRIEND {}", sender))
    }

    async fn handle_get_friends(&mut self) -> Reply {
        let me = self.username().to_string();
        let entries = self.domain.friends.friends_of(&me).await;

        // Live presence, not the persisted status cache
        let mut parts = Vec::with_capacity(entries.len());
        for entry in &entries {
            let status = self.domain.presence.status_of(&entry.name).await;
            parts.push(format!("{}:{}", entry.name, status));
        }

        if parts.is_empty() {
            Reply::success(200, "FRIENDS")
        } else {
            Reply::success(200, format!("FRIENDS {}", parts.join(" ")))
        }
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    async fn handle_init_group(&mut self, name: &str, max_members: u32) -> Reply {
        let me = self.username().to_string();
        if !self.domain.groups.create(name, &me, max_members).await {
            return Reply::fail(409, "GROUP_EXISTS");
        }
        self.persist_groups().await;
        info!(client = self.client_id, group = name, max = max_members, "group created");
        Reply::success(201, format!("GROUP_CREATED {}", name))
    }

    async fn handle_send_invite(&mut self, group: &str, target: &str) -> Reply {
        let me = self.username().to_string();
        match self.domain.groups.invite(group, &me, target).await {
            Err(InviteError::GroupNotFound) => Reply::fail(404, "GROUP_NOT_FOUND"),
            Err(InviteError::NoPermission) => Reply::fail(403, "NO_PERMISSION"),
            Err(InviteError::AlreadyMember) => Reply::fail(409, "ALREADY_MEMBER"),
            Ok(()) => {
                self.persist_invites().await;
                self.domain
                    .presence
                    .notify(target, notify::group_invite(group, &me))
                    .await;
                Reply::success(200, format!("INVITE_SENT {}", target))
            }
        }
    }

    async fn handle_confirm_join(&mut self, group: &str) -> Reply {
        let me = self.username().to_string();
        match self.domain.groups.confirm_join(group, &me).await {
            Err(JoinError::GroupNotFound) => Reply::fail(404, "GROUP_NOT_FOUND"),
            Err(JoinError::InviteNotFound) => Reply::fail(404, "INVITE_NOT_FOUND"),
            Err(JoinError::GroupFull) => Reply::fail(403, "GROUP_FULL"),
            Ok(members) => {
                self.persist_groups().await;
                self.persist_invites().await;
                info!(client = self.client_id, group, user = %me, "joined group");
                for member in members.iter().filter(|m| *m != &me) {
                    self.domain
                        .presence
                        .notify(member, notify::member_join(group, &me))
                        .await;
                }
                Reply::success(201, format!("JOINED {}", group))
            }
        }
    }

    async fn handle_reject_join(&mut self, group: &str) -> Reply {
        let me = self.username().to_string();
        match self.domain.groups.reject_join(group, &me).await {
            Err(JoinError::GroupNotFound) => Reply::fail(404, "GROUP_NOT_FOUND"),
            Err(JoinError::InviteNotFound) | Err(JoinError::GroupFull) => {
                Reply::fail(404, "INVITE_NOT_FOUND")
            }
            Ok(creator) => {
                self.persist_invites().await;
                self.domain
                    .presence
                    .notify(&creator, notify::invite_rejected(group, &me))
                    .await;
                Reply::success(200, "REJECTED_JOIN")
            }
        }
    }

    async fn handle_eject_user(&mut self, group: &str, target: &str) -> Reply {
        let me = self.username().to_string();
        match self.domain.groups.eject(group, &me, target).await {
            Err(EjectError::GroupNotFound) => Reply::fail(404, "GROUP_NOT_FOUND"),
            Err(EjectError::NoPermission) => Reply::fail(403, "NO_PERMISSION"),
            Err(EjectError::UserNotFound) => Reply::fail(404, "USER_NOT_FOUND"),
            Ok(remaining) => {
                self.persist_groups().await;
                self.persist_invites().await;
                info!(client = self.client_id, group, target, "member ejected");
                self.domain
                    .presence
                    .notify(target, notify::ejected(group, &me))
                    .await;
                for member in &remaining {
                    self.domain
                        .presence
                        .notify(member, notify::member_left(group, target))
                        .await;
                }
                Reply::success(200, format!("EJECTED {}", target))
            }
        }
    }

    async fn handle_get_members(&mut self, group: &str) -> Reply {
        let me = self.username().to_string();
        let Some(info) = self.domain.groups.get(group).await else {
            return Reply::fail(404, "GROUP_NOT_FOUND");
        };
        if !info.is_member(&me) {
            return Reply::fail(403, "NOT_A_MEMBER");
        }

        let mut parts = Vec::with_capacity(info.members.len());
        for member in &info.members {
            let status = self.domain.presence.status_of(member).await;
            parts.push(format!("{}:{}:{}", member, info.role_of(member), status));
        }
        Reply::success(200, format!("MEMBERS {}", parts.join(" ")))
    }

    async fn handle_get_groups(&mut self) -> Reply {
        let me = self.username().to_string();
        let groups = self.domain.groups.groups_of(&me).await;
        let parts: Vec<String> = groups
            .iter()
            .map(|(name, count)| format!("{}:{}", name, count))
            .collect();

        if parts.is_empty() {
            Reply::success(200, "GROUPS")
        } else {
            Reply::success(200, format!("GROUPS {}", parts.join(" ")))
        }
    }

    // ------------------------------------------------------------------
    // Messaging and history
    // ------------------------------------------------------------------

    async fn handle_text(&mut self, scope: Scope, target: &str, content: &str) -> Reply {
        let me = self.username().to_string();
        let ts = current_timestamp();
        let record = MessageRecord {
            ts,
            sender: me.clone(),
            kind: "TEXT".to_string(),
            content: content.to_string(),
        };

        match scope {
            Scope::User => {
                // Delivery requires an existing friendship
                let Some(conv) = self.domain.friends.conversation_id(&me, target).await else {
                    return Reply::fail(404, "USER_NOT_FOUND");
                };
                if let Err(e) = self
                    .store
                    .append_message(&LogKey::Direct(conv), &record)
                    .await
                {
                    warn!(client = self.client_id, error = %e, "message save failed");
                    return Reply::fail(500, "SAVE_FAILED");
                }
                self.domain
                    .presence
                    .notify(target, notify::text_user(&me, ts, content))
                    .await;
                Reply::success(201, "SENT")
            }
            Scope::Group => {
                let Some(group) = self.domain.groups.get(target).await else {
                    return Reply::fail(404, "GROUP_NOT_FOUND");
                };
                if !group.is_member(&me) {
                    return Reply::fail(403, "NOT_A_MEMBER");
                }
                if let Err(e) = self
                    .store
                    .append_message(&LogKey::Group(target.to_string()), &record)
                    .await
                {
                    warn!(client = self.client_id, error = %e, "message save failed");
                    return Reply::fail(500, "SAVE_FAILED");
                }
                // History saves once; delivery only to the other members
                for member in group.members.iter().filter(|m| *m != &me) {
                    self.domain
                        .presence
                        .notify(member, notify::text_group(target, &me, ts, content))
                        .await;
                }
                Reply::success(201, "SENT")
            }
        }
    }

    async fn handle_history(
        &mut self,
        scope: Scope,
        target: &str,
        begin: &str,
        end: &str,
    ) -> Result<()> {
        let me = self.username().to_string();

        let key = match scope {
            Scope::User => match self.domain.friends.conversation_id(&me, target).await {
                Some(conv) => LogKey::Direct(conv),
                None => return self.send_reply(Reply::fail(404, "CONVERSATION_NOT_FOUND")).await,
            },
            Scope::Group => {
                let Some(group) = self.domain.groups.get(target).await else {
                    return self.send_reply(Reply::fail(404, "GROUP_NOT_FOUND")).await;
                };
                if !group.is_member(&me) {
                    return self.send_reply(Reply::fail(403, "ACCESS_DENIED")).await;
                }
                LogKey::Group(target.to_string())
            }
        };

        let range = TimeRange::parse(begin, end);
        let records = match self.store.read_messages(&key).await {
            Ok(records) => records,
            Err(e) => {
                warn!(client = self.client_id, error = %e, "history read failed");
                return self.send_reply(Reply::fail(500, "SERVER_ERROR")).await;
            }
        };

        let selected = select_range(records, &range);
        if selected.is_empty() {
            return self.send_reply(Reply::fail(404, "NO_MESSAGES")).await;
        }

        self.send_reply(Reply::success(200, selected.len().to_string()))
            .await?;
        for (idx, record) in selected.iter().enumerate() {
            self.send_line(&record.to_response_line(idx + 1)).await?;
        }
        Ok(())
    }
}
