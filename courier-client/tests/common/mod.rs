//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_client::{
    Dispatch, EngineHandle, MemoryCache, Session, Settings, TransferSnapshot, Transport,
    TransportError,
};
use courier_common::{
    Completion, CorrelationKey, OutboundRequest, THUMBNAIL_NAMESPACE, TransferCommand,
    TransferEvent,
};

/// Upper bound on any wait in these tests
pub const WAIT_LIMIT: Duration = Duration::from_secs(60);

/// Transport that records what it was asked to do
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundRequest>>,
    controls: Mutex<Vec<(CorrelationKey, TransferCommand)>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn controls(&self) -> Vec<(CorrelationKey, TransferCommand)> {
        self.controls.lock().unwrap().clone()
    }

    /// Key of the most recent full (non-preview) request
    pub fn last_full_key(&self) -> CorrelationKey {
        self.sent()
            .into_iter()
            .rev()
            .find(|request| !request.key.is_in(THUMBNAIL_NAMESPACE))
            .expect("no full request sent")
            .key
    }

    /// Key of the most recent preview request
    pub fn last_preview_key(&self) -> CorrelationKey {
        self.sent()
            .into_iter()
            .rev()
            .find(|request| request.key.is_in(THUMBNAIL_NAMESPACE))
            .expect("no preview request sent")
            .key
    }

    pub fn preview_requests(&self) -> usize {
        self.sent()
            .iter()
            .filter(|request| request.key.is_in(THUMBNAIL_NAMESPACE))
            .count()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, request: &OutboundRequest) -> Result<Dispatch, TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(Dispatch::Sent)
    }

    fn control(&self, key: &CorrelationKey, command: TransferCommand) -> Result<(), TransportError> {
        self.controls.lock().unwrap().push((key.clone(), command));
        Ok(())
    }
}

pub struct Harness {
    pub session: Session,
    pub transport: Arc<RecordingTransport>,
    pub cache: Arc<MemoryCache>,
}

pub fn harness() -> Harness {
    harness_with(Settings::default())
}

pub fn harness_with(settings: Settings) -> Harness {
    let transport = Arc::new(RecordingTransport::default());
    let cache = Arc::new(MemoryCache::new());
    let session = Session::new(transport.clone(), cache.clone(), settings);
    Harness {
        session,
        transport,
        cache,
    }
}

impl Harness {
    pub fn publish(&self, event: TransferEvent) {
        self.session.bus().publish_transfer(event);
    }

    pub fn progress(&self, key: &CorrelationKey, percent: u8) {
        self.publish(TransferEvent::Progress {
            key: key.clone(),
            percent,
        });
    }

    pub fn complete(&self, key: &CorrelationKey, outcome: Completion) {
        self.publish(TransferEvent::Completed {
            key: key.clone(),
            outcome,
            cached: false,
        });
    }
}

/// Wait until the engine publishes a snapshot matching `predicate`
pub async fn wait_until<F>(handle: &EngineHandle, predicate: F) -> TransferSnapshot
where
    F: FnMut(&TransferSnapshot) -> bool,
{
    tokio::time::timeout(WAIT_LIMIT, handle.wait_for(predicate))
        .await
        .expect("timed out waiting for engine")
        .expect("engine stopped")
}

/// Let every spawned task run until the runtime is idle (paused clock only)
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
