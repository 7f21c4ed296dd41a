//! Seam to the chat SDK that carries requests over the wire
//!
//! The SDK is opaque to this crate. It accepts requests and control signals
//! without blocking and reports back through `TransferEvent`s published on
//! the [`EventBus`](crate::bus::EventBus).

use courier_common::{CorrelationKey, OutboundRequest, TransferCommand};
use thiserror::Error;

/// How the transport accepted a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// On the wire
    Sent,
    /// Held by the transport until it can send (e.g., while reconnecting)
    Queued,
}

/// Transport refused a request outright
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is disconnected")]
    Disconnected,

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Outbound side of the chat SDK
pub trait Transport: Send + Sync {
    /// Hand a request to the SDK
    fn send(&self, request: &OutboundRequest) -> Result<Dispatch, TransportError>;

    /// Signal an outstanding request identified by `key`
    fn control(&self, key: &CorrelationKey, command: TransferCommand)
    -> Result<(), TransportError>;
}
