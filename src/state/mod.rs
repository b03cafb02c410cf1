//! In-memory domain state
//!
//! Each conceptual table has its own lock; the discipline is to take one
//! table's lock, do the work, and release it before touching another.
//! No lock is held across disk or socket I/O — persistence works from
//! snapshots taken after the lock is dropped.

pub mod files;
pub mod friends;
pub mod groups;
pub mod presence;
pub mod sessions;
pub mod users;

pub use files::{FileMetadata, FileTable};
pub use friends::{FriendEntry, FriendTable};
pub use groups::{EjectError, Group, GroupTable, InviteError, JoinError};
pub use presence::{PeerEvent, PeerHandle, Presence, PresenceStatus};
pub use sessions::SessionTable;
pub use users::UserTable;

/// All domain tables, shared across connection tasks
pub struct Domain {
    pub users: UserTable,
    pub sessions: SessionTable,
    pub friends: FriendTable,
    pub groups: GroupTable,
    pub presence: Presence,
    pub files: FileTable,
}

impl Domain {
    pub fn new() -> Self {
        Self {
            users: UserTable::new(),
            sessions: SessionTable::new(),
            friends: FriendTable::new(),
            groups: GroupTable::new(),
            presence: Presence::new(),
            files: FileTable::new(),
        }
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}
