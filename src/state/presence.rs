//! Online presence map and peer event delivery
//!
//! Presence means an open connection currently bound to the account,
//! distinct from session existence (a session can outlive a disconnect).
//! Each online user maps to the sender side of their connection's event
//! channel; the connection task writes queued events onto its own socket
//! between commands.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tracing::debug;

/// Cached or live online state of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn from_online(online: bool) -> Self {
        if online {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }

    /// Parse a persisted status; anything unrecognised is offline
    pub fn parse(s: &str) -> Self {
        match s {
            "online" => PresenceStatus::Online,
            _ => PresenceStatus::Offline,
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered to a connection task through its event channel
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Write one `NOTIFY*` line to the peer
    Notify(String),
    /// The session was evicted by a newer login: write
    /// `NOTIFY SESSION_EXPIRED <sid>` and close the connection
    Expire(String),
}

/// Handle for pushing events at one online connection
pub type PeerHandle = UnboundedSender<PeerEvent>;

/// Map of online users to their connection handles
pub struct Presence {
    online: RwLock<HashMap<String, PeerHandle>>,
}

impl Presence {
    pub fn new() -> Self {
        Self {
            online: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a connection handle to a username, replacing any previous one
    pub async fn insert(&self, username: &str, handle: PeerHandle) {
        self.online
            .write()
            .await
            .insert(username.to_string(), handle);
    }

    /// Remove a user's handle, returning it (used for eviction)
    pub async fn remove(&self, username: &str) -> Option<PeerHandle> {
        self.online.write().await.remove(username)
    }

    /// Remove the entry only if it still belongs to the given connection;
    /// a disconnecting task must not unregister a newer login's handle
    pub async fn remove_if_same(&self, username: &str, handle: &PeerHandle) {
        let mut online = self.online.write().await;
        if let Some(current) = online.get(username) {
            if current.same_channel(handle) {
                online.remove(username);
            }
        }
    }

    /// Whether the user currently holds an online connection
    pub async fn is_online(&self, username: &str) -> bool {
        self.online.read().await.contains_key(username)
    }

    /// Live status lookup
    pub async fn status_of(&self, username: &str) -> PresenceStatus {
        PresenceStatus::from_online(self.is_online(username).await)
    }

    /// Deliver one notification line to an online user; best-effort.
    /// Returns false when the user is offline or their channel is gone.
    pub async fn notify(&self, username: &str, message: String) -> bool {
        let online = self.online.read().await;
        match online.get(username) {
            Some(handle) => handle.send(PeerEvent::Notify(message)).is_ok(),
            None => {
                debug!(user = username, %message, "notify skipped: recipient offline");
                false
            }
        }
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}
