//! QMP client errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QmpError {
    /// Socket I/O failure
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// A line was not valid JSON
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// QEMU answered with an error object
    #[error("command failed: {0}")]
    Command(String),

    /// The monitor closed the connection
    #[error("connection closed by monitor")]
    ConnectionClosed,

    /// Connect or handshake took too long
    #[error("timed out waiting for the monitor")]
    Timeout,

    /// The guest migration ended in the failed state
    #[error("migration failed: {0}")]
    MigrationFailed(String),
}
