//! Resumable transfer engines
//!
//! Each engine wraps one asset and owns the correlation keys of its
//! outstanding requests. Engines never wait on the network: calls hand a
//! request to the transport and return, and results come back as
//! `TransferEvent`s.
//!
//! Key types:
//! - `DownloadEngine` - cache-aware download with an optional preview fetch
//! - `UploadEngine` - send-with-attachment upload
//! - `TransferStateMachine` - the contract both engines implement
//! - `EngineHandle` - non-blocking handle to an engine running on its own task

mod download;
mod subscription;
mod types;
mod upload;

use std::sync::Arc;

use courier_common::{
    AssetDescriptor, CorrelationKey, OutboundRequest, RequestKind, SizeTier, TransferCommand,
    TransferEvent, TransferState,
};
use tracing::warn;

use crate::bus::EventBus;
use crate::cache::CacheProbe;
use crate::pending::CorrelationStore;
use crate::transport::{Dispatch, Transport};

pub use download::DownloadEngine;
pub use subscription::{EngineClosed, EngineHandle, WeakEngineHandle, spawn_engine};
pub use types::{EngineError, PreviewOutcome, TransferSnapshot};
pub use upload::UploadEngine;

/// Collaborators every engine needs
#[derive(Clone)]
pub struct EngineContext {
    /// Shared pending-request store
    pub store: CorrelationStore<OutboundRequest>,
    /// Outbound side of the SDK
    pub transport: Arc<dyn Transport>,
    /// Local asset cache
    pub cache: Arc<dyn CacheProbe>,
    /// Bus for dependent notifications (finished uploads)
    pub bus: EventBus,
    /// Tier requested for images whose descriptor has none
    pub image_tier: SizeTier,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("store", &self.store)
            .field("image_tier", &self.image_tier)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Register `kind` under `key` and hand it to the transport
    ///
    /// The entry is registered first so a fast response always finds it, and
    /// removed again if the transport refuses the request.
    fn issue(&self, key: CorrelationKey, kind: RequestKind) -> Result<Dispatch, EngineError> {
        let request = OutboundRequest::new(key.clone(), kind);
        self.store.register(key.clone(), request.clone(), true);
        match self.transport.send(&request) {
            Ok(dispatch) => Ok(dispatch),
            Err(e) => {
                self.store.remove(&key);
                Err(e.into())
            }
        }
    }

    /// Drop a held key and tell the transport to stop working on it
    fn abandon(&self, key: &CorrelationKey) {
        if self.store.pop(key).is_some()
            && let Err(e) = self.transport.control(key, TransferCommand::Cancel)
        {
            warn!(key = %key, error = %e, "failed to cancel request");
        }
    }
}

/// State reached when a non-terminal event arrives for the held key
///
/// Progress moves a queued transfer to active. Suspend and resume
/// confirmations complete the two-phase pause and resume.
fn signal_transition(state: TransferState, event: &TransferEvent) -> Option<TransferState> {
    match (event, state) {
        (TransferEvent::Progress { .. }, TransferState::Queued) => Some(TransferState::Active),
        (
            TransferEvent::Suspended { .. },
            TransferState::Queued | TransferState::Active | TransferState::Pausing,
        ) => Some(TransferState::Paused),
        (TransferEvent::Resumed { .. }, TransferState::Paused | TransferState::Resuming) => {
            Some(TransferState::Active)
        }
        _ => None,
    }
}

/// The contract shared by download and upload engines
///
/// Every method is synchronous and returns without waiting on the network.
/// Only events and timeouts addressed to a key the engine holds have any
/// effect; everything else is dropped as stale.
pub trait TransferStateMachine {
    /// Asset this engine transfers
    fn asset(&self) -> &AssetDescriptor;

    /// Begin (or retry) the full transfer
    fn start(&mut self) -> Result<(), EngineError>;

    /// Ask the transport to suspend the active transfer
    fn pause(&mut self) -> Result<(), EngineError>;

    /// Ask the transport to resume a paused transfer
    fn resume(&mut self) -> Result<(), EngineError>;

    /// Abort everything outstanding; a no-op once terminal
    fn cancel(&mut self) -> Result<(), EngineError>;

    /// Fetch a low-resolution preview alongside the full transfer
    fn download_preview(&mut self, _quality: f32, _size: u32) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("download_preview"))
    }

    /// Apply a transport event; returns true if it changed anything
    fn on_event(&mut self, event: &TransferEvent) -> bool;

    /// React to the store evicting `key`; returns true if the key was held
    fn on_timeout(&mut self, key: &CorrelationKey) -> bool;

    /// Returns true if `key` belongs to one of this engine's requests
    fn holds(&self, key: &CorrelationKey) -> bool;

    /// Every key this engine is currently waiting on
    fn held_keys(&self) -> Vec<CorrelationKey>;

    fn state(&self) -> TransferState;

    fn progress(&self) -> u8;

    fn snapshot(&self) -> TransferSnapshot;

    /// Outcome of the last preview request, once it has one
    fn take_preview_outcome(&mut self) -> Option<PreviewOutcome> {
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording transport and fixtures for engine tests

    use std::sync::Mutex;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::transport::TransportError;

    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<OutboundRequest>>,
        pub controls: Mutex<Vec<(CorrelationKey, TransferCommand)>>,
        pub dispatch: Mutex<Option<Dispatch>>,
        pub fail_sends: Mutex<bool>,
    }

    impl RecordingTransport {
        pub fn sent(&self) -> Vec<OutboundRequest> {
            self.sent.lock().expect("sent").clone()
        }

        pub fn controls(&self) -> Vec<(CorrelationKey, TransferCommand)> {
            self.controls.lock().expect("controls").clone()
        }

        pub fn last_key(&self) -> CorrelationKey {
            self.sent().last().expect("no request sent").key.clone()
        }

        pub fn queue_sends(&self) {
            *self.dispatch.lock().expect("dispatch") = Some(Dispatch::Queued);
        }

        pub fn refuse_sends(&self) {
            *self.fail_sends.lock().expect("fail") = true;
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, request: &OutboundRequest) -> Result<Dispatch, TransportError> {
            if *self.fail_sends.lock().expect("fail") {
                return Err(TransportError::Disconnected);
            }
            self.sent.lock().expect("sent").push(request.clone());
            Ok(self
                .dispatch
                .lock()
                .expect("dispatch")
                .unwrap_or(Dispatch::Sent))
        }

        fn control(
            &self,
            key: &CorrelationKey,
            command: TransferCommand,
        ) -> Result<(), TransportError> {
            self.controls
                .lock()
                .expect("controls")
                .push((key.clone(), command));
            Ok(())
        }
    }

    pub struct Fixture {
        pub transport: Arc<RecordingTransport>,
        pub cache: Arc<MemoryCache>,
        pub ctx: EngineContext,
    }

    pub fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let cache = Arc::new(MemoryCache::new());
        let ctx = EngineContext {
            store: CorrelationStore::new(),
            transport: transport.clone(),
            cache: cache.clone(),
            bus: EventBus::default(),
            image_tier: SizeTier::Large,
        };
        Fixture {
            transport,
            cache,
            ctx,
        }
    }
}
