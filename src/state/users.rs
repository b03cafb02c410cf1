//! Registered user accounts

use std::collections::HashMap;

use tokio::sync::RwLock;

/// Account table: username to password
///
/// Usernames are non-empty whitespace-free tokens and unique; accounts
/// are never deleted. Passwords are stored verbatim.
pub struct UserTable {
    users: RwLock<HashMap<String, String>>,
}

impl UserTable {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new account; returns false when the username is taken
    pub async fn register(&self, username: &str, password: &str) -> bool {
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return false;
        }
        users.insert(username.to_string(), password.to_string());
        true
    }

    /// Check credentials
    pub async fn verify(&self, username: &str, password: &str) -> bool {
        let users = self.users.read().await;
        users.get(username).map(|p| p == password).unwrap_or(false)
    }

    /// Whether the username is registered
    pub async fn contains(&self, username: &str) -> bool {
        self.users.read().await.contains_key(username)
    }

    /// Copy of the table for persistence
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.users.read().await.clone()
    }

    /// Replace the table contents (startup load)
    pub async fn load(&self, entries: HashMap<String, String>) {
        *self.users.write().await = entries;
    }
}

impl Default for UserTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_verify() {
        let table = UserTable::new();

        assert!(table.register("alice", "s3cret").await);
        assert!(!table.register("alice", "other").await);

        assert!(table.verify("alice", "s3cret").await);
        assert!(!table.verify("alice", "wrong").await);
        assert!(!table.verify("bob", "s3cret").await);
        assert!(table.contains("alice").await);
    }

    #[tokio::test]
    async fn test_snapshot_load_roundtrip() {
        let table = UserTable::new();
        table.register("alice", "a").await;
        table.register("bob", "b").await;

        let snapshot = table.snapshot().await;
        let restored = UserTable::new();
        restored.load(snapshot).await;

        assert!(restored.verify("alice", "a").await);
        assert!(restored.verify("bob", "b").await);
    }
}
