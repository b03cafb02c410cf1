//! Session tokens and the single-active-session policy

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct SessionMaps {
    /// session_id -> username
    sessions: HashMap<String, String>,
    /// username -> session_id (at most one session per username)
    user_to_session: HashMap<String, String>,
}

/// Session table
///
/// Creating a session for a user evicts any previous one; the caller is
/// responsible for notifying and closing the evicted connection.
pub struct SessionTable {
    inner: RwLock<SessionMaps>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SessionMaps::default()),
        }
    }

    /// Mint a session for `username`, returning the new session id and
    /// the evicted one when the user was already logged in
    pub async fn create(&self, username: &str) -> (String, Option<String>) {
        let session_id = Uuid::new_v4().to_string();
        let mut maps = self.inner.write().await;

        let evicted = maps.user_to_session.remove(username);
        if let Some(old_sid) = &evicted {
            maps.sessions.remove(old_sid);
        }

        maps.sessions
            .insert(session_id.clone(), username.to_string());
        maps.user_to_session
            .insert(username.to_string(), session_id.clone());

        (session_id, evicted)
    }

    /// Resolve a session id to its username
    pub async fn resolve(&self, session_id: &str) -> Option<String> {
        self.inner.read().await.sessions.get(session_id).cloned()
    }

    /// Remove a session, returning the username it was bound to
    pub async fn remove(&self, session_id: &str) -> Option<String> {
        let mut maps = self.inner.write().await;
        let username = maps.sessions.remove(session_id)?;
        maps.user_to_session.remove(&username);
        Some(username)
    }

    /// Copy of the table for persistence, as (session_id, username) pairs
    pub async fn snapshot(&self) -> Vec<(String, String)> {
        let maps = self.inner.read().await;
        maps.sessions
            .iter()
            .map(|(sid, user)| (sid.clone(), user.clone()))
            .collect()
    }

    /// Replace the table contents (startup load); later pairs win when a
    /// username appears twice, preserving the single-session invariant
    pub async fn load(&self, entries: Vec<(String, String)>) {
        let mut maps = self.inner.write().await;
        maps.sessions.clear();
        maps.user_to_session.clear();
        for (sid, user) in entries {
            if let Some(stale) = maps.user_to_session.insert(user.clone(), sid.clone()) {
                maps.sessions.remove(&stale);
            }
            maps.sessions.insert(sid, user);
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
