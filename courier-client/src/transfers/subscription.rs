//! Engine driver tasks
//!
//! Each engine runs on its own task, which is the single place its state is
//! mutated. The task selects over three inputs:
//! 1. Commands from `EngineHandle`s (start, pause, preview, ...)
//! 2. Bus events addressed to a key the engine holds
//! 3. Timeout notifications from the correlation store
//!
//! Completions may write to the cache, so they are applied on the blocking
//! pool. After every input the task publishes a fresh `TransferSnapshot` for
//! observers. The task ends when every handle is dropped or `shutdown` is
//! called.

use courier_common::{AssetDescriptor, CorrelationKey, OutboundRequest, TransferEvent, TransferState};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::{PreviewOutcome, TransferSnapshot, TransferStateMachine};
use crate::bus::{Delivery, EventBus, Subscription};
use crate::pending::CorrelationStore;

/// Commands forwarded from handles to the driver task
#[derive(Debug)]
enum EngineCommand {
    Start,
    Pause,
    Resume,
    Cancel,
    DownloadPreview {
        quality: f32,
        size: u32,
        reply: oneshot::Sender<PreviewOutcome>,
    },
    Shutdown,
}

impl EngineCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::DownloadPreview { .. } => "download_preview",
            Self::Shutdown => "shutdown",
        }
    }
}

/// The engine task has stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transfer engine has stopped")]
pub struct EngineClosed;

/// Run `engine` on its own task and return a handle to it
///
/// Subscriptions are taken before the task starts, so no event published
/// after this returns can be missed. Must be called within a Tokio runtime.
pub fn spawn_engine<E>(
    engine: E,
    bus: &EventBus,
    store: &CorrelationStore<OutboundRequest>,
) -> EngineHandle
where
    E: TransferStateMachine + Send + Sync + 'static,
{
    let asset = engine.asset().clone();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot());
    let events = bus.subscribe_transfers();
    let timeouts = store.subscribe_timeouts();

    tokio::spawn(drive(
        engine,
        store.clone(),
        commands_rx,
        events,
        timeouts,
        snapshot_tx,
    ));

    EngineHandle {
        asset,
        commands: commands_tx,
        snapshots: snapshot_rx,
    }
}

async fn drive<E>(
    mut engine: E,
    store: CorrelationStore<OutboundRequest>,
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    mut events: Subscription<TransferEvent>,
    mut timeouts: Subscription<CorrelationKey>,
    snapshots: watch::Sender<TransferSnapshot>,
) where
    E: TransferStateMachine + Send + Sync + 'static,
{
    let hash = engine.asset().hash.clone();
    let mut preview_waiter: Option<oneshot::Sender<PreviewOutcome>> = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                let name = command.name();
                let result = match command {
                    EngineCommand::Shutdown => break,
                    EngineCommand::Start => engine.start(),
                    EngineCommand::Pause => engine.pause(),
                    EngineCommand::Resume => engine.resume(),
                    EngineCommand::Cancel => engine.cancel(),
                    EngineCommand::DownloadPreview { quality, size, reply } => {
                        let result = engine.download_preview(quality, size);
                        if result.is_ok() {
                            if let Some(previous) = preview_waiter.replace(reply) {
                                let _ = previous.send(PreviewOutcome::Superseded);
                            }
                        } else {
                            let _ = reply.send(PreviewOutcome::Rejected);
                        }
                        result
                    }
                };
                if let Err(e) = result {
                    debug!(hash = %hash, command = name, error = %e, "engine command refused");
                }
            }
            event = events.recv_matching(|key| engine.holds(key)) => {
                let Some(event) = event else {
                    break;
                };
                if matches!(event, TransferEvent::Completed { .. }) {
                    let applied = tokio::task::spawn_blocking(move || {
                        engine.on_event(&event);
                        engine
                    })
                    .await;
                    engine = match applied {
                        Ok(engine) => engine,
                        Err(e) => {
                            warn!(hash = %hash, error = %e, "engine failed applying completion");
                            return;
                        }
                    };
                } else {
                    engine.on_event(&event);
                }
            }
            delivery = timeouts.recv_or_lagged() => match delivery {
                None => break,
                Some(Delivery::Event(key)) => {
                    engine.on_timeout(&key);
                }
                Some(Delivery::Lagged(_)) => reconcile_evictions(&mut engine, &store),
            },
        }

        if let Some(outcome) = engine.take_preview_outcome()
            && let Some(waiter) = preview_waiter.take()
        {
            let _ = waiter.send(outcome);
        }

        let snapshot = engine.snapshot();
        snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    debug!(hash = %hash, state = %engine.state(), "engine task stopped");
}

/// Treat every held key the store no longer has as timed out
///
/// Run after the timeout subscription lagged and the skipped notifications
/// are gone. A held key only leaves the store through eviction or a reset,
/// and either way no response is coming for it.
fn reconcile_evictions<E>(engine: &mut E, store: &CorrelationStore<OutboundRequest>)
where
    E: TransferStateMachine,
{
    for key in engine.held_keys() {
        if !store.contains(&key) {
            debug!(key = %key, "recovering missed timeout");
            engine.on_timeout(&key);
        }
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Non-blocking handle to an engine task
///
/// Every command only enqueues and returns. Effects show up in the
/// snapshot once the task has applied them.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    asset: AssetDescriptor,
    commands: mpsc::UnboundedSender<EngineCommand>,
    snapshots: watch::Receiver<TransferSnapshot>,
}

impl EngineHandle {
    pub fn asset(&self) -> &AssetDescriptor {
        &self.asset
    }

    pub fn start(&self) -> Result<(), EngineClosed> {
        self.send(EngineCommand::Start)
    }

    pub fn pause(&self) -> Result<(), EngineClosed> {
        self.send(EngineCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), EngineClosed> {
        self.send(EngineCommand::Resume)
    }

    pub fn cancel(&self) -> Result<(), EngineClosed> {
        self.send(EngineCommand::Cancel)
    }

    /// Request a preview; the receiver resolves once the request has an outcome
    ///
    /// The receiver errors if the engine task stops first.
    pub fn download_preview(
        &self,
        quality: f32,
        size: u32,
    ) -> Result<oneshot::Receiver<PreviewOutcome>, EngineClosed> {
        let (reply, outcome) = oneshot::channel();
        self.send(EngineCommand::DownloadPreview {
            quality,
            size,
            reply,
        })?;
        Ok(outcome)
    }

    /// Stop the engine task; outstanding keys stay in the store until they time out
    pub fn shutdown(&self) {
        let _ = self.send(EngineCommand::Shutdown);
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> TransferSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn state(&self) -> TransferState {
        self.snapshots.borrow().state
    }

    pub fn progress(&self) -> u8 {
        self.snapshots.borrow().progress
    }

    /// Watch every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<TransferSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a snapshot satisfies `predicate`
    ///
    /// Returns `None` if the task stops before that happens.
    pub async fn wait_for<F>(&self, predicate: F) -> Option<TransferSnapshot>
    where
        F: FnMut(&TransferSnapshot) -> bool,
    {
        let mut snapshots = self.snapshots.clone();
        snapshots
            .wait_for(predicate)
            .await
            .ok()
            .map(|snapshot| snapshot.clone())
    }

    /// Returns true once the engine task has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// A handle that doesn't keep the engine task alive
    pub fn downgrade(&self) -> WeakEngineHandle {
        WeakEngineHandle {
            asset: self.asset.clone(),
            commands: self.commands.downgrade(),
            snapshots: self.snapshots.clone(),
        }
    }

    fn send(&self, command: EngineCommand) -> Result<(), EngineClosed> {
        self.commands.send(command).map_err(|_| EngineClosed)
    }
}

/// Handle that lets the engine task end when its owners drop their handles
#[derive(Debug, Clone)]
pub struct WeakEngineHandle {
    asset: AssetDescriptor,
    commands: mpsc::WeakUnboundedSender<EngineCommand>,
    snapshots: watch::Receiver<TransferSnapshot>,
}

impl WeakEngineHandle {
    pub fn asset(&self) -> &AssetDescriptor {
        &self.asset
    }

    /// Strong handle, if the engine is still owned somewhere
    pub fn upgrade(&self) -> Option<EngineHandle> {
        self.commands.upgrade().map(|commands| EngineHandle {
            asset: self.asset.clone(),
            commands,
            snapshots: self.snapshots.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::thread::ThreadId;
    use std::time::Duration;

    use super::*;
    use crate::cache::{CacheError, CacheProbe, MemoryCache};
    use crate::transfers::testing::fixture;
    use crate::transfers::{DownloadEngine, EngineContext};
    use courier_common::{Completion, SizeTier, TransferError};

    /// Memory cache that remembers which thread each write ran on
    #[derive(Default)]
    struct WriterThreads {
        inner: MemoryCache,
        writers: Mutex<Vec<ThreadId>>,
    }

    impl CacheProbe for WriterThreads {
        fn exists(&self, asset: &AssetDescriptor) -> bool {
            self.inner.exists(asset)
        }

        fn path(&self, asset: &AssetDescriptor) -> Option<PathBuf> {
            self.inner.path(asset)
        }

        fn load(&self, asset: &AssetDescriptor) -> Result<Option<Vec<u8>>, CacheError> {
            self.inner.load(asset)
        }

        fn store(&self, asset: &AssetDescriptor, bytes: &[u8]) -> Result<(), CacheError> {
            self.writers
                .lock()
                .expect("writers")
                .push(std::thread::current().id());
            self.inner.store(asset, bytes)
        }
    }

    fn image() -> AssetDescriptor {
        AssetDescriptor::image("img", None, SizeTier::Large)
    }

    fn spawn(ctx: &EngineContext, asset: AssetDescriptor) -> EngineHandle {
        spawn_engine(DownloadEngine::new(asset, ctx.clone()), &ctx.bus, &ctx.store)
    }

    #[tokio::test]
    async fn test_handle_drives_engine() {
        let fx = fixture();
        let handle = spawn(&fx.ctx, image());
        assert_eq!(handle.state(), TransferState::Undefined);

        handle.start().expect("start");
        handle
            .wait_for(|s| s.state == TransferState::Active)
            .await
            .expect("active");
        let key = fx.transport.last_key();

        fx.ctx.bus.publish_transfer(TransferEvent::Progress {
            key: key.clone(),
            percent: 42,
        });
        handle.wait_for(|s| s.progress == 42).await.expect("progress");

        fx.ctx.bus.publish_transfer(TransferEvent::Completed {
            key,
            outcome: Completion::Data(b"full".to_vec()),
            cached: false,
        });
        let done = handle
            .wait_for(|s| s.is_completed())
            .await
            .expect("completed");
        assert_eq!(done.progress, 100);
    }

    #[tokio::test]
    async fn test_events_for_other_keys_are_ignored() {
        let fx = fixture();
        let handle = spawn(&fx.ctx, image());
        handle.start().expect("start");
        handle
            .wait_for(|s| s.state == TransferState::Active)
            .await
            .expect("active");

        fx.ctx.bus.publish_transfer(TransferEvent::Progress {
            key: CorrelationKey::generate(),
            percent: 90,
        });
        // Round-trip a command so the event has been seen
        handle.pause().expect("pause");
        handle
            .wait_for(|s| s.state == TransferState::Pausing)
            .await
            .expect("pausing");
        assert_eq!(handle.progress(), 0);
    }

    #[tokio::test]
    async fn test_preview_reply() {
        let fx = fixture();
        let handle = spawn(&fx.ctx, image());

        let outcome = handle.download_preview(0.5, 256).expect("preview");
        handle
            .wait_for(|s| s.state == TransferState::ThumbnailActive)
            .await
            .expect("thumbnail active");

        fx.ctx.bus.publish_transfer(TransferEvent::Completed {
            key: fx.transport.last_key(),
            outcome: Completion::Data(b"thumb".to_vec()),
            cached: false,
        });
        assert_eq!(outcome.await, Ok(PreviewOutcome::Ready));
        assert!(handle.snapshot().preview.is_some());
    }

    #[tokio::test]
    async fn test_refused_preview_replies_rejected() {
        let fx = fixture();
        let handle = spawn(&fx.ctx, AssetDescriptor::file("doc"));

        let outcome = handle.download_preview(0.5, 256).expect("preview");
        assert_eq!(outcome.await, Ok(PreviewOutcome::Rejected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_fails_engine() {
        let mut fx = fixture();
        fx.ctx.store = CorrelationStore::with_timeout(Duration::from_secs(5));
        let handle = spawn(&fx.ctx, image());

        handle.start().expect("start");
        let failed = handle
            .wait_for(|s| s.is_failed())
            .await
            .expect("failed");
        assert_eq!(failed.error, Some(TransferError::Timeout));
        assert!(fx.ctx.store.is_empty());
    }

    #[tokio::test]
    async fn test_completion_writes_cache_off_runtime_thread() {
        let mut fx = fixture();
        let cache = Arc::new(WriterThreads::default());
        fx.ctx.cache = cache.clone();
        let handle = spawn(&fx.ctx, AssetDescriptor::file("doc"));

        handle.start().expect("start");
        handle
            .wait_for(|s| s.state == TransferState::Active)
            .await
            .expect("active");
        fx.ctx.bus.publish_transfer(TransferEvent::Completed {
            key: fx.transport.last_key(),
            outcome: Completion::Data(b"doc".to_vec()),
            cached: false,
        });
        handle
            .wait_for(|s| s.is_completed())
            .await
            .expect("completed");

        let writers = cache.writers.lock().expect("writers").clone();
        assert_eq!(writers.len(), 1);
        assert_ne!(writers[0], std::thread::current().id());
    }

    #[tokio::test]
    async fn test_reconcile_fails_keys_missing_from_store() {
        let fx = fixture();
        let mut engine = DownloadEngine::new(AssetDescriptor::file("doc"), fx.ctx.clone());
        engine.start().expect("start");
        let key = fx.transport.last_key();

        reconcile_evictions(&mut engine, &fx.ctx.store);
        assert_eq!(engine.state(), TransferState::Active);

        // Evicted while its notification was lost
        fx.ctx.store.remove(&key);
        reconcile_evictions(&mut engine, &fx.ctx.store);
        assert_eq!(engine.state(), TransferState::Failed);
        assert_eq!(engine.error(), Some(TransferError::Timeout));
        assert!(engine.held_keys().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_task() {
        let fx = fixture();
        let handle = spawn(&fx.ctx, image());
        let weak = handle.downgrade();
        let mut snapshots = handle.subscribe();

        assert!(weak.upgrade().is_some());
        drop(handle);
        assert!(weak.upgrade().is_none());

        while snapshots.changed().await.is_ok() {}
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let fx = fixture();
        let handle = spawn(&fx.ctx, image());
        let mut snapshots = handle.subscribe();

        handle.shutdown();
        while snapshots.changed().await.is_ok() {}

        assert!(handle.is_closed());
        assert_eq!(handle.start(), Err(EngineClosed));
    }
}
