//! Cache-aware download engine

use std::path::PathBuf;
use std::sync::Arc;

use courier_common::{
    AssetDescriptor, Completion, CorrelationKey, RequestKind, THUMBNAIL_NAMESPACE, TransferCommand,
    TransferError, TransferEvent, TransferProgress, TransferState,
};
use tracing::{debug, trace, warn};

use super::types::now_timestamp;
use super::{
    EngineContext, EngineError, PreviewOutcome, TransferSnapshot, TransferStateMachine,
    signal_transition,
};
use crate::transport::Dispatch;

/// Downloads one asset, short-circuiting through the local cache
///
/// Holds at most one key for the full fetch and one (in the `THUMBNAIL`
/// namespace) for a preview fetch. The two run independently; the full
/// result always wins over the preview.
#[derive(Debug)]
pub struct DownloadEngine {
    asset: AssetDescriptor,
    ctx: EngineContext,
    state: TransferState,
    progress: TransferProgress,
    key: Option<CorrelationKey>,
    preview_key: Option<CorrelationKey>,
    /// State to fall back to if the preview fetch fails
    before_preview: TransferState,
    preview: Option<Arc<[u8]>>,
    location: Option<PathBuf>,
    error: Option<TransferError>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    preview_outcome: Option<PreviewOutcome>,
}

impl DownloadEngine {
    /// Create an engine for `asset`
    ///
    /// Images without a tier get the context's default tier. A thumbnail
    /// already in the cache is loaded right away and the engine starts out
    /// `ThumbnailReady`.
    pub fn new(mut asset: AssetDescriptor, ctx: EngineContext) -> Self {
        if asset.is_image() && asset.tier.is_none() {
            asset.tier = Some(ctx.image_tier);
        }

        let mut engine = Self {
            asset,
            ctx,
            state: TransferState::Undefined,
            progress: TransferProgress::default(),
            key: None,
            preview_key: None,
            before_preview: TransferState::Undefined,
            preview: None,
            location: None,
            error: None,
            started_at: None,
            completed_at: None,
            preview_outcome: None,
        };
        engine.load_cached_preview();
        engine
    }

    /// Preview bytes, if a thumbnail has been loaded or fetched
    pub fn preview_bytes(&self) -> Option<&[u8]> {
        self.preview.as_deref()
    }

    /// Where the completed asset lives, for file-backed caches
    pub fn location(&self) -> Option<&PathBuf> {
        self.location.as_ref()
    }

    pub fn error(&self) -> Option<TransferError> {
        self.error
    }

    fn load_cached_preview(&mut self) {
        if !self.asset.is_image() {
            return;
        }
        match self.ctx.cache.load(&self.asset.preview()) {
            Ok(Some(bytes)) => {
                debug!(hash = %self.asset.hash, "loaded cached thumbnail");
                self.preview = Some(bytes.into());
                self.state = TransferState::ThumbnailReady;
            }
            Ok(None) => {}
            Err(e) => warn!(hash = %self.asset.hash, error = %e, "failed to read cached thumbnail"),
        }
    }

    fn fetch_request(&self) -> RequestKind {
        match self.asset.tier {
            Some(tier) if self.asset.is_image() => RequestKind::FetchImage {
                hash: self.asset.hash.clone(),
                url: self.asset.url.clone(),
                tier,
            },
            _ => RequestKind::FetchFile {
                hash: self.asset.hash.clone(),
            },
        }
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            debug!(hash = %self.asset.hash, from = %self.state, to = %state, "download state");
            self.state = state;
        }
    }

    /// The full asset is local
    fn finish(&mut self) {
        self.progress.complete();
        self.error = None;
        self.preview = None;
        self.completed_at = Some(now_timestamp());
        self.release_preview(PreviewOutcome::Superseded);
        self.set_state(TransferState::Completed);
    }

    fn fail(&mut self, error: TransferError) {
        self.key = None;
        self.error = Some(error);
        self.completed_at = Some(now_timestamp());
        self.set_state(TransferState::Failed);
    }

    /// Drop an outstanding preview request, reporting `outcome` to its waiter
    fn release_preview(&mut self, outcome: PreviewOutcome) {
        if let Some(key) = self.preview_key.take() {
            self.ctx.abandon(&key);
            self.preview_outcome = Some(outcome);
        }
    }

    fn persist(&mut self, outcome: &Completion, cached: bool) -> Result<(), TransferError> {
        let written = match outcome {
            Completion::Data(_) | Completion::File(_) if cached => Ok(()),
            Completion::Data(bytes) => self.ctx.cache.store(&self.asset, bytes),
            Completion::File(path) => self.ctx.cache.import(&self.asset, path),
            Completion::Remote(url) => {
                warn!(hash = %self.asset.hash, url = %url, "download completed with a remote url");
                return Err(TransferError::Protocol);
            }
            Completion::Failed(error) => return Err(*error),
        };
        if let Err(e) = written {
            warn!(hash = %self.asset.hash, error = %e, "failed to cache downloaded asset");
            return Err(TransferError::Io);
        }

        self.location = self.ctx.cache.path(&self.asset).or_else(|| match outcome {
            Completion::File(path) => Some(path.clone()),
            _ => None,
        });
        Ok(())
    }

    fn on_full_event(&mut self, key: &CorrelationKey, event: &TransferEvent) -> bool {
        match event {
            TransferEvent::Completed { outcome, cached, .. } => {
                if self.ctx.store.pop(key).is_none() {
                    trace!(key = %key, "dropping completion for evicted request");
                    return false;
                }
                self.key = None;
                match self.persist(outcome, *cached) {
                    Ok(()) => self.finish(),
                    Err(error) => self.fail(error),
                }
                true
            }
            _ if !self.ctx.store.contains(key) => {
                trace!(key = %key, "dropping event for evicted request");
                false
            }
            _ => {
                self.ctx.store.refresh(key);
                let mut changed = match event {
                    TransferEvent::Progress { percent, .. } => self.progress.advance(*percent),
                    _ => false,
                };
                if let Some(next) = signal_transition(self.state, event) {
                    self.set_state(next);
                    changed = true;
                }
                changed
            }
        }
    }

    fn on_preview_event(&mut self, key: &CorrelationKey, event: &TransferEvent) -> bool {
        let TransferEvent::Completed { outcome, cached, .. } = event else {
            // Preview progress isn't surfaced, it only keeps the request alive
            self.ctx.store.refresh(key);
            return false;
        };
        if self.ctx.store.pop(key).is_none() {
            trace!(key = %key, "dropping preview completion for evicted request");
            return false;
        }
        self.preview_key = None;

        match outcome {
            Completion::Data(bytes) => self.accept_preview(bytes.clone(), *cached),
            Completion::File(path) => match std::fs::read(path) {
                Ok(bytes) => self.accept_preview(bytes, *cached),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read preview file");
                    self.preview_failed(TransferError::Io);
                }
            },
            Completion::Remote(_) => self.preview_failed(TransferError::Protocol),
            Completion::Failed(error) => self.preview_failed(*error),
        }
        true
    }

    fn accept_preview(&mut self, bytes: Vec<u8>, cached: bool) {
        if self.state == TransferState::Completed {
            // The full asset is already here
            self.preview_outcome = Some(PreviewOutcome::Superseded);
            return;
        }
        if !cached && let Err(e) = self.ctx.cache.store(&self.asset.preview(), &bytes) {
            warn!(hash = %self.asset.hash, error = %e, "failed to cache thumbnail");
        }

        self.preview = Some(bytes.into());
        self.preview_outcome = Some(PreviewOutcome::Ready);
        if self.state == TransferState::ThumbnailActive {
            self.set_state(TransferState::ThumbnailReady);
        }
    }

    fn preview_failed(&mut self, error: TransferError) {
        debug!(hash = %self.asset.hash, error = %error, "preview failed");
        self.preview_outcome = Some(PreviewOutcome::from_error(error));
        if self.state == TransferState::ThumbnailActive {
            let fallback = if self.preview.is_some() {
                TransferState::ThumbnailReady
            } else {
                self.before_preview
            };
            self.set_state(fallback);
        }
    }
}

impl TransferStateMachine for DownloadEngine {
    fn asset(&self) -> &AssetDescriptor {
        &self.asset
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if !self.state.can_start() {
            return Err(EngineError::invalid("start", self.state));
        }

        self.error = None;
        self.started_at = Some(now_timestamp());
        self.completed_at = None;

        if self.ctx.cache.exists(&self.asset) {
            debug!(hash = %self.asset.hash, "cache hit");
            self.location = self.ctx.cache.path(&self.asset);
            self.finish();
            return Ok(());
        }

        self.progress.reset();
        let key = CorrelationKey::generate();
        match self.ctx.issue(key.clone(), self.fetch_request()) {
            Ok(dispatch) => {
                self.key = Some(key);
                self.set_state(match dispatch {
                    Dispatch::Sent => TransferState::Active,
                    Dispatch::Queued => TransferState::Queued,
                });
                Ok(())
            }
            Err(e) => {
                warn!(hash = %self.asset.hash, error = %e, "failed to issue download");
                self.fail(TransferError::Connection);
                Err(e)
            }
        }
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        let (Some(key), TransferState::Active) = (&self.key, self.state) else {
            return Err(EngineError::invalid("pause", self.state));
        };
        self.ctx.transport.control(key, TransferCommand::Suspend)?;
        self.set_state(TransferState::Pausing);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        let (Some(key), TransferState::Paused) = (&self.key, self.state) else {
            return Err(EngineError::invalid("resume", self.state));
        };
        self.ctx.transport.control(key, TransferCommand::Resume)?;
        self.set_state(TransferState::Resuming);
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), EngineError> {
        if !self.state.is_cancellable() {
            return Ok(());
        }
        if let Some(key) = self.key.take() {
            self.ctx.abandon(&key);
        }
        self.release_preview(PreviewOutcome::Failed(TransferError::Cancelled));
        self.fail(TransferError::Cancelled);
        Ok(())
    }

    fn download_preview(&mut self, quality: f32, size: u32) -> Result<(), EngineError> {
        if !self.asset.is_image() {
            return Err(EngineError::Unsupported("download_preview"));
        }
        if self.state == TransferState::Completed || self.preview_key.is_some() {
            return Err(EngineError::invalid("download_preview", self.state));
        }

        let key = CorrelationKey::generate_in(THUMBNAIL_NAMESPACE);
        let request = RequestKind::FetchPreview {
            hash: self.asset.hash.clone(),
            url: self.asset.url.clone(),
            quality,
            size,
        };
        self.ctx.issue(key.clone(), request)?;
        self.preview_key = Some(key);
        self.preview_outcome = None;

        if matches!(
            self.state,
            TransferState::Undefined | TransferState::Failed | TransferState::ThumbnailReady
        ) {
            self.before_preview = self.state;
            self.set_state(TransferState::ThumbnailActive);
        }
        Ok(())
    }

    fn on_event(&mut self, event: &TransferEvent) -> bool {
        let key = event.key();
        if self.key.as_ref() == Some(key) {
            self.on_full_event(key, event)
        } else if self.preview_key.as_ref() == Some(key) {
            self.on_preview_event(key, event)
        } else {
            trace!(key = %key, "ignoring event for a key this engine doesn't hold");
            false
        }
    }

    fn on_timeout(&mut self, key: &CorrelationKey) -> bool {
        if self.key.as_ref() == Some(key) {
            self.progress.reset();
            self.fail(TransferError::Timeout);
            true
        } else if self.preview_key.as_ref() == Some(key) {
            self.preview_key = None;
            self.preview_failed(TransferError::Timeout);
            true
        } else {
            false
        }
    }

    fn holds(&self, key: &CorrelationKey) -> bool {
        self.key.as_ref() == Some(key) || self.preview_key.as_ref() == Some(key)
    }

    fn held_keys(&self) -> Vec<CorrelationKey> {
        self.key.iter().chain(&self.preview_key).cloned().collect()
    }

    fn state(&self) -> TransferState {
        self.state
    }

    fn progress(&self) -> u8 {
        self.progress.percent()
    }

    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            state: self.state,
            progress: self.progress.percent(),
            preview: self.preview.clone(),
            location: self.location.clone(),
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    fn take_preview_outcome(&mut self) -> Option<PreviewOutcome> {
        self.preview_outcome.take()
    }
}
