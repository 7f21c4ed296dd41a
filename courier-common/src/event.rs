//! Events delivered by the transport for outstanding requests

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::asset::AssetDescriptor;
use crate::error_kind::TransferError;
use crate::key::CorrelationKey;

/// Result carried by a completion event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Completion {
    /// Asset bytes delivered in memory
    Data(Vec<u8>),
    /// Asset written to a local file by the transport
    File(PathBuf),
    /// Upload accepted; the server's URL for the stored object
    Remote(String),
    /// The operation failed
    Failed(TransferError),
}

impl Completion {
    /// Returns true for a successful outcome
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Event answering one correlation key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    /// Percentage of the transfer done so far
    Progress { key: CorrelationKey, percent: u8 },

    /// The transport confirmed a suspend
    Suspended { key: CorrelationKey },

    /// The transport confirmed a resume
    Resumed { key: CorrelationKey },

    /// The operation finished
    Completed {
        key: CorrelationKey,
        outcome: Completion,
        /// Served from the transport's own cache rather than the network
        #[serde(default)]
        cached: bool,
    },
}

impl TransferEvent {
    /// The correlation key this event answers
    pub fn key(&self) -> &CorrelationKey {
        match self {
            Self::Progress { key, .. }
            | Self::Suspended { key }
            | Self::Resumed { key }
            | Self::Completed { key, .. } => key,
        }
    }

    /// Returns true for completion events
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Published when an upload finishes, so dependents can treat the asset as
/// locally resident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFinished {
    pub asset: AssetDescriptor,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}
