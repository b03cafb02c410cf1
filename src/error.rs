//! Error handling for the chat server

use std::fmt;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat server error types
///
/// Protocol-level failures that a client should see travel as `FAIL`
/// reply lines, not as `ChatError`; this type covers transport, storage
/// and internal faults.
#[derive(Debug, Clone)]
pub enum ChatError {
    /// Socket-level errors (read/write/accept failures, peer gone)
    Network(String),
    /// Persistence errors (data directory, table files, message logs)
    Storage(String),
    /// Malformed wire data (bad chunk header, oversized frame)
    Protocol(String),
    /// Configuration error
    Config(String),
    /// Server internal error
    Internal(String),
}

impl ChatError {
    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        ChatError::Network(msg.into())
    }

    /// Create a storage error
    pub fn storage<T: Into<String>>(msg: T) -> Self {
        ChatError::Storage(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        ChatError::Protocol(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChatError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Network(msg) => write!(f, "Network error: {}", msg),
            ChatError::Storage(msg) => write!(f, "Storage error: {}", msg),
            ChatError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ChatError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ChatError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Network(format!("IO error: {}", err))
    }
}

impl From<std::net::AddrParseError> for ChatError {
    fn from(err: std::net::AddrParseError) -> Self {
        ChatError::Config(format!("Invalid address: {}", err))
    }
}
