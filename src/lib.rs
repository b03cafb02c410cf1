//! Palaver - Multi-User TCP Chat Server
//!
//! A single-process chat server speaking a line-oriented, stateful text
//! protocol over TCP, with binary file transfer interleaved on the same
//! socket.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): request-line grammar, single-line
//!   replies, `NOTIFY*` events and the 8-byte chunk framing used by the
//!   file transfer phases
//! - **Domain state** ([`state`]): per-table in-memory managers (users,
//!   sessions, friends, groups, presence, files) behind their own locks
//! - **Persistence** ([`storage`]): flat text-file tables rewritten
//!   whole on mutation plus append-only message/file-event logs and raw
//!   upload blobs
//! - **History** ([`history`]): timestamped records, flexible time-range
//!   parsing and length-prefixed query responses
//! - **Server** ([`server`]): TCP listener, one task per connection,
//!   command dispatch and the store-and-forward transfer engine
//!
//! ## Example
//!
//! ```rust,ignore
//! use palaver::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> palaver::Result<()> {
//!     let server = ChatServer::new(ServerConfig::default());
//!     server.run().await
//! }
//! ```

pub mod error;
pub mod history;
pub mod protocol;
pub mod server;
pub mod state;
pub mod storage;

pub use error::{ChatError, Result};
pub use server::{ChatServer, ServerConfig};

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
