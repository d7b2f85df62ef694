//! Error types for cosync sessions

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Core error: {0}")]
    Core(#[from] cosync_core::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] cosync_protocol::ProtocolError),

    #[error("Host error: {0}")]
    Host(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown partition: {0}")]
    UnknownPartition(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
