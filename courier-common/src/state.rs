//! Transfer state and progress shared by download and upload engines

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::PROGRESS_COMPLETE;

// =============================================================================
// Transfer State
// =============================================================================

/// Current state of one asset's transfer
///
/// Exactly one state is live per asset. `Pausing` and `Resuming` record an
/// intent sent to the transport that has not been confirmed by an event yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// No transfer attempted
    #[default]
    Undefined,
    /// Request handed to the transport, which has not started sending yet
    Queued,
    /// Downloading or uploading
    Active,
    /// Suspend requested, waiting for confirmation
    Pausing,
    /// Suspended by the transport
    Paused,
    /// Resume requested, waiting for confirmation
    Resuming,
    /// Fetching a low-resolution preview
    ThumbnailActive,
    /// Preview bytes available, full asset not yet fetched
    ThumbnailReady,
    /// Full asset available
    Completed,
    /// Timed out, cancelled, or rejected by the server
    Failed,
}

impl TransferState {
    /// Returns true for states no further event can leave on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true while a full-transfer request is outstanding
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Active | Self::Pausing | Self::Paused | Self::Resuming
        )
    }

    /// Returns true if `start` may be called from this state
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            Self::Undefined | Self::ThumbnailActive | Self::ThumbnailReady | Self::Failed
        )
    }

    /// Returns true if `cancel` has anything to abort
    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal()
    }

    /// String form used in logs and persisted snapshots
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::ThumbnailActive => "thumbnail_active",
            Self::ThumbnailReady => "thumbnail_ready",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Transfer Progress
// =============================================================================

/// Completion percentage of the current transfer (0 to 100)
///
/// Only moves forward while a transfer runs; a new `start` resets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferProgress(u8);

impl TransferProgress {
    /// Current percentage
    pub fn percent(&self) -> u8 {
        self.0
    }

    /// Record a reported percentage, ignoring regressions
    ///
    /// Returns true if the value changed.
    pub fn advance(&mut self, percent: u8) -> bool {
        let percent = percent.min(PROGRESS_COMPLETE);
        if percent > self.0 {
            self.0 = percent;
            true
        } else {
            false
        }
    }

    /// Force the value to 100
    pub fn complete(&mut self) {
        self.0 = PROGRESS_COMPLETE;
    }

    /// Back to 0 for a fresh attempt
    pub fn reset(&mut self) {
        self.0 = 0;
    }
}
