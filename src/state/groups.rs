//! Group membership, invites and admin rights
//!
//! Invariant: `user_groups[u]` contains `g` exactly when `u` is in
//! `groups[g].members`. The three maps share one lock because every
//! mutation touches at least two of them.

use std::collections::HashMap;

use tokio::sync::RwLock;

/// A chat group; the creator is admin and always a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub creator: String,
    pub max_members: u32,
    pub members: Vec<String>,
}

impl Group {
    pub fn is_member(&self, user: &str) -> bool {
        self.members.iter().any(|m| m == user)
    }

    /// `admin` for the creator, `member` otherwise
    pub fn role_of(&self, user: &str) -> &'static str {
        if user == self.creator {
            "admin"
        } else {
            "member"
        }
    }
}

/// Why an invite could not be issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteError {
    GroupNotFound,
    NoPermission,
    AlreadyMember,
}

/// Why a join could not be completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    GroupNotFound,
    InviteNotFound,
    GroupFull,
}

/// Why an eject could not be completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EjectError {
    GroupNotFound,
    NoPermission,
    UserNotFound,
}

#[derive(Default)]
struct GroupMaps {
    /// group name -> group
    groups: HashMap<String, Group>,
    /// username -> groups the user belongs to
    user_groups: HashMap<String, Vec<String>>,
    /// group name -> invited usernames
    invites: HashMap<String, Vec<String>>,
}

/// Group table
pub struct GroupTable {
    inner: RwLock<GroupMaps>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GroupMaps::default()),
        }
    }

    /// Create a group with the creator as sole member; false when the
    /// name is taken
    pub async fn create(&self, name: &str, creator: &str, max_members: u32) -> bool {
        let mut maps = self.inner.write().await;
        if maps.groups.contains_key(name) {
            return false;
        }
        maps.groups.insert(
            name.to_string(),
            Group {
                name: name.to_string(),
                creator: creator.to_string(),
                max_members,
                members: vec![creator.to_string()],
            },
        );
        maps.user_groups
            .entry(creator.to_string())
            .or_default()
            .push(name.to_string());
        true
    }

    /// Issue an invite; admin-only, no effect on existing members.
    /// Repeated invites coalesce into a single entry.
    pub async fn invite(&self, group: &str, by: &str, target: &str) -> Result<(), InviteError> {
        let mut maps = self.inner.write().await;
        let g = maps.groups.get(group).ok_or(InviteError::GroupNotFound)?;
        if g.creator != by {
            return Err(InviteError::NoPermission);
        }
        if g.is_member(target) {
            return Err(InviteError::AlreadyMember);
        }
        let invites = maps.invites.entry(group.to_string()).or_default();
        if !invites.iter().any(|u| u == target) {
            invites.push(target.to_string());
        }
        Ok(())
    }

    /// Move a user from the invite list into the membership. Full groups
    /// refuse the join and keep the invite. Returns the member list after
    /// the join (for notification fan-out).
    pub async fn confirm_join(&self, group: &str, user: &str) -> Result<Vec<String>, JoinError> {
        let mut maps = self.inner.write().await;
        if !maps.groups.contains_key(group) {
            return Err(JoinError::GroupNotFound);
        }

        {
            let invites = maps.invites.get(group).ok_or(JoinError::InviteNotFound)?;
            let pos = invites
                .iter()
                .position(|u| u == user)
                .ok_or(JoinError::InviteNotFound)?;

            let g = &maps.groups[group];
            if g.members.len() as u32 >= g.max_members {
                return Err(JoinError::GroupFull);
            }

            let invites = maps.invites.get_mut(group).unwrap();
            invites.remove(pos);
        }

        let g = maps.groups.get_mut(group).unwrap();
        g.members.push(user.to_string());
        let members = g.members.clone();
        maps.user_groups
            .entry(user.to_string())
            .or_default()
            .push(group.to_string());

        Ok(members)
    }

    /// Drop a user's invite; returns the creator for notification
    pub async fn reject_join(&self, group: &str, user: &str) -> Result<String, JoinError> {
        let mut maps = self.inner.write().await;
        let creator = maps
            .groups
            .get(group)
            .map(|g| g.creator.clone())
            .ok_or(JoinError::GroupNotFound)?;

        let invites = maps.invites.get_mut(group).ok_or(JoinError::InviteNotFound)?;
        let pos = invites
            .iter()
            .position(|u| u == user)
            .ok_or(JoinError::InviteNotFound)?;
        invites.remove(pos);

        Ok(creator)
    }

    /// Remove a member; admin-only, and the admin cannot eject themself.
    /// Any leftover invite for the target is cleared too. Returns the
    /// remaining member list.
    pub async fn eject(&self, group: &str, by: &str, target: &str) -> Result<Vec<String>, EjectError> {
        let mut maps = self.inner.write().await;
        let g = maps.groups.get(group).ok_or(EjectError::GroupNotFound)?;
        if g.creator != by || target == by {
            return Err(EjectError::NoPermission);
        }
        if !g.is_member(target) {
            return Err(EjectError::UserNotFound);
        }

        let g = maps.groups.get_mut(group).unwrap();
        g.members.retain(|m| m != target);
        let remaining = g.members.clone();

        if let Some(user_groups) = maps.user_groups.get_mut(target) {
            user_groups.retain(|name| name != group);
        }
        if let Some(invites) = maps.invites.get_mut(group) {
            invites.retain(|u| u != target);
        }

        Ok(remaining)
    }

    /// Clone of a group's record
    pub async fn get(&self, group: &str) -> Option<Group> {
        self.inner.read().await.groups.get(group).cloned()
    }

    /// Whether the user belongs to the group
    pub async fn is_member(&self, group: &str, user: &str) -> bool {
        self.inner
            .read()
            .await
            .groups
            .get(group)
            .map(|g| g.is_member(user))
            .unwrap_or(false)
    }

    /// The user's groups as (name, member count) pairs, in join order
    pub async fn groups_of(&self, user: &str) -> Vec<(String, usize)> {
        let maps = self.inner.read().await;
        maps.user_groups
            .get(user)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| {
                        maps.groups.get(name).map(|g| (name.clone(), g.members.len()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copy of the group map for persistence
    pub async fn snapshot(&self) -> HashMap<String, Group> {
        self.inner.read().await.groups.clone()
    }

    /// Copy of the invite map for persistence
    pub async fn snapshot_invites(&self) -> HashMap<String, Vec<String>> {
        self.inner.read().await.invites.clone()
    }

    /// Replace groups and rebuild the user_groups index (startup load)
    pub async fn load(&self, groups: HashMap<String, Group>) {
        let mut maps = self.inner.write().await;
        maps.user_groups.clear();
        for (name, group) in &groups {
            for member in &group.members {
                maps.user_groups
                    .entry(member.clone())
                    .or_default()
                    .push(name.clone());
            }
        }
        maps.groups = groups;
    }

    /// Replace the invite map (startup load)
    pub async fn load_invites(&self, invites: HashMap<String, Vec<String>>) {
        self.inner.write().await.invites = invites;
    }
}

impl Default for GroupTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_membership_invariant() {
        let table = GroupTable::new();
        assert!(table.create("devs", "alice", 5).await);
        assert!(!table.create("devs", "bob", 5).await);

        assert!(table.is_member("devs", "alice").await);
        let groups = table.groups_of("alice").await;
        assert_eq!(groups, vec![("devs".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_invite_join_flow() {
        let table = GroupTable::new();
        table.create("devs", "alice", 5).await;

        assert_eq!(
            table.invite("devs", "bob", "carol").await,
            Err(InviteError::NoPermission)
        );
        assert_eq!(
            table.invite("devs", "alice", "alice").await,
            Err(InviteError::AlreadyMember)
        );
        table.invite("devs", "alice", "carol").await.unwrap();
        // Duplicate invites coalesce
        table.invite("devs", "alice", "carol").await.unwrap();

        let members = table.confirm_join("devs", "carol").await.unwrap();
        assert_eq!(members, vec!["alice".to_string(), "carol".to_string()]);
        assert!(table.is_member("devs", "carol").await);
        assert_eq!(table.groups_of("carol").await, vec![("devs".to_string(), 2)]);

        // Invite was consumed
        assert_eq!(
            table.confirm_join("devs", "carol").await,
            Err(JoinError::InviteNotFound)
        );
    }

    #[tokio::test]
    async fn test_join_respects_member_limit() {
        let table = GroupTable::new();
        table.create("pair", "alice", 2).await;
        table.invite("pair", "alice", "bob").await.unwrap();
        table.invite("pair", "alice", "carol").await.unwrap();

        table.confirm_join("pair", "bob").await.unwrap();
        assert_eq!(
            table.confirm_join("pair", "carol").await,
            Err(JoinError::GroupFull)
        );
        // The invite survives a refused join
        table.eject("pair", "alice", "bob").await.unwrap();
        table.confirm_join("pair", "carol").await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_join() {
        let table = GroupTable::new();
        table.create("devs", "alice", 5).await;
        table.invite("devs", "alice", "bob").await.unwrap();

        assert_eq!(table.reject_join("devs", "bob").await.unwrap(), "alice");
        assert_eq!(
            table.reject_join("devs", "bob").await,
            Err(JoinError::InviteNotFound)
        );
    }

    #[tokio::test]
    async fn test_eject_rules() {
        let table = GroupTable::new();
        table.create("devs", "alice", 5).await;
        table.invite("devs", "alice", "bob").await.unwrap();
        table.confirm_join("devs", "bob").await.unwrap();

        assert_eq!(
            table.eject("devs", "bob", "alice").await,
            Err(EjectError::NoPermission)
        );
        assert_eq!(
            table.eject("devs", "alice", "alice").await,
            Err(EjectError::NoPermission)
        );
        assert_eq!(
            table.eject("devs", "alice", "ghost").await,
            Err(EjectError::UserNotFound)
        );

        let remaining = table.eject("devs", "alice", "bob").await.unwrap();
        assert_eq!(remaining, vec!["alice".to_string()]);
        assert!(!table.is_member("devs", "bob").await);
        assert!(table.groups_of("bob").await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_load_rebuilds_user_groups() {
        let table = GroupTable::new();
        table.create("devs", "alice", 5).await;
        table.invite("devs", "alice", "bob").await.unwrap();
        table.confirm_join("devs", "bob").await.unwrap();

        let restored = GroupTable::new();
        restored.load(table.snapshot().await).await;
        restored.load_invites(table.snapshot_invites().await).await;

        assert!(restored.is_member("devs", "bob").await);
        assert_eq!(restored.groups_of("bob").await, vec![("devs".to_string(), 2)]);
    }
}
