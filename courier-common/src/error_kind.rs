//! Machine-readable error kinds for transfer operations
//!
//! These travel inside completion events, letting engines decide whether an
//! outcome is retryable (e.g., a preview the server has not generated yet).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a transfer did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferError {
    /// Asset doesn't exist on the server
    #[error("asset not found")]
    NotFound,
    /// Server-side derivative (e.g., a thumbnail) not generated yet
    #[error("asset not ready yet")]
    NotReady,
    /// Permission denied
    #[error("permission denied")]
    Permission,
    /// No response within the eviction window
    #[error("request timed out")]
    Timeout,
    /// Aborted by the user
    #[error("transfer cancelled")]
    Cancelled,
    /// Network failure
    #[error("connection error")]
    #[serde(rename = "connection_error")]
    Connection,
    /// Invalid or unexpected response
    #[error("protocol error")]
    #[serde(rename = "protocol_error")]
    Protocol,
    /// Local file I/O failed
    #[error("i/o error")]
    #[serde(rename = "io_error")]
    Io,
    #[error("unknown error")]
    Unknown,
}

impl TransferError {
    /// Parse an error_kind string from the server
    pub fn from_server_error_kind(kind: &str) -> Self {
        match kind {
            "not_found" => Self::NotFound,
            "not_ready" => Self::NotReady,
            "permission" => Self::Permission,
            "timeout" => Self::Timeout,
            "cancelled" => Self::Cancelled,
            "connection_error" => Self::Connection,
            "protocol_error" => Self::Protocol,
            "io_error" => Self::Io,
            _ => Self::Unknown,
        }
    }

    /// Returns true if calling `start` again may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound | Self::Permission)
    }
}
