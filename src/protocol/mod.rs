//! Wire protocol: text command grammar, reply lines and binary chunk framing

pub mod chunk;
pub mod command;
pub mod response;

pub use chunk::{ChunkHeader, CHUNK_HEADER_SIZE, MAX_CHUNK_SIZE};
pub use command::{Command, ParseError, Scope};
pub use response::Reply;
