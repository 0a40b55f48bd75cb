use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("write not acknowledged within {0:?}")]
    WriteTimeout(Duration),
    #[error("write failed: {0}")]
    Write(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("malformed response to {command:?}: {raw:?}")]
    MalformedResponse { command: String, raw: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("config error: {0}")]
    Config(String),
}

impl DriverError {
    /// True for errors raised because the owning scope was torn down.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found: {id}")]
    NotFound { id: String },
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
