//! Error taxonomy for cfsync.
//!
//! Setup failures (validation, connection, host key, ignore file, initial
//! listing) propagate to the caller. Once the watch loop runs, `Transfer`
//! errors are logged per event and never stop the loop.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Target not eligible or bad local path
    #[error("{0}")]
    Validation(String),

    /// Dial, handshake or authentication failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Host key did not match the expected fingerprint
    #[error("{message}\n\nThe fingerprint of the received key was {fingerprint:?}.")]
    HostKey {
        message: String,
        fingerprint: String,
    },

    /// A single remote operation failed
    #[error("{op} '{path}' failed: {message}")]
    Transfer {
        op: &'static str,
        path: String,
        message: String,
    },

    /// Filesystem watch could not start
    #[error("watch error: {0}")]
    Watch(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn transfer(op: &'static str, path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SyncError::Transfer {
            op,
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Fingerprint observed on the wire, if this is a host key failure.
    pub fn observed_fingerprint(&self) -> Option<&str> {
        match self {
            SyncError::HostKey { fingerprint, .. } => Some(fingerprint),
            _ => None,
        }
    }
}

impl From<ssh2::Error> for SyncError {
    fn from(err: ssh2::Error) -> Self {
        SyncError::Connection(err.to_string())
    }
}

impl From<notify::Error> for SyncError {
    fn from(err: notify::Error) -> Self {
        SyncError::Watch(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<ignore::Error> for SyncError {
    fn from(err: ignore::Error) -> Self {
        SyncError::Config(format!("invalid ignore file: {}", err))
    }
}
