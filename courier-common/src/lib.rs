//! Courier Common Library
//!
//! Shared vocabulary for the courier transfer core: correlation keys, asset
//! descriptors, transfer states, outbound requests, and the events the
//! transport delivers back.

pub mod asset;
mod error_kind;
pub mod event;
pub mod key;
pub mod request;
pub mod state;

pub use asset::{AssetDescriptor, AssetKind, SizeTier};
pub use error_kind::TransferError;
pub use event::{Completion, TransferEvent, UploadFinished};
pub use key::CorrelationKey;
pub use request::{Attachment, MessageDraft, OutboundRequest, RequestKind, TransferCommand};
pub use state::{TransferProgress, TransferState};

/// Namespace for correlation keys owned by thumbnail (preview) fetches
pub const THUMBNAIL_NAMESPACE: &str = "THUMBNAIL";

/// Default number of seconds a pending request may wait for a response
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 25;

/// Progress value reported by a finished transfer
pub const PROGRESS_COMPLETE: u8 = 100;
