//! Types shared by the download and upload engines

use std::path::PathBuf;
use std::sync::Arc;

use courier_common::{TransferError, TransferState};
use thiserror::Error;

use crate::cache::CacheError;
use crate::transport::TransportError;

// =============================================================================
// Engine Error
// =============================================================================

/// Why an engine call was refused
///
/// A refused call leaves the engine's state as it was, except for transport
/// failures while starting, which fail the transfer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The call isn't valid from the current state
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: TransferState,
    },

    /// The engine doesn't offer this operation
    #[error("{0} is not supported for this transfer")]
    Unsupported(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl EngineError {
    pub(crate) fn invalid(operation: &'static str, state: TransferState) -> Self {
        Self::InvalidState { operation, state }
    }
}

// =============================================================================
// Preview Outcome
// =============================================================================

/// How a preview request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewOutcome {
    /// Preview bytes are available
    Ready,
    /// The server has not generated the preview yet
    NotReady,
    /// The preview failed for another reason
    Failed(TransferError),
    /// The full asset arrived first, or the request was dropped
    Superseded,
    /// The engine refused to issue the request
    Rejected,
}

impl PreviewOutcome {
    pub(crate) fn from_error(error: TransferError) -> Self {
        match error {
            TransferError::NotReady => Self::NotReady,
            other => Self::Failed(other),
        }
    }
}

// =============================================================================
// Transfer Snapshot
// =============================================================================

/// Read-only view of an engine for observers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferSnapshot {
    /// Current state
    pub state: TransferState,

    /// Percentage of the current transfer (0 to 100)
    pub progress: u8,

    /// Preview bytes (thumbnail for downloads, local bytes for image uploads)
    pub preview: Option<Arc<[u8]>>,

    /// Local location of the completed asset, for file-backed caches
    pub location: Option<PathBuf>,

    /// Why the last attempt failed
    pub error: Option<TransferError>,

    /// Timestamp when the current attempt was issued
    pub started_at: Option<i64>,

    /// Timestamp when the current attempt completed or failed
    pub completed_at: Option<i64>,
}

impl TransferSnapshot {
    /// Returns true if the full asset is available
    pub fn is_completed(&self) -> bool {
        self.state == TransferState::Completed
    }

    /// Returns true if the transfer failed
    pub fn is_failed(&self) -> bool {
        self.state == TransferState::Failed
    }

    /// Calculate elapsed time in seconds (from start to now or completion)
    pub fn elapsed_seconds(&self) -> Option<i64> {
        let start = self.started_at?;
        let end = self
            .completed_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        Some(end - start)
    }
}

/// Current UTC time in seconds
pub(crate) fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Tests
// =============================================================================
