//! Upload engine for send-with-attachment requests

use std::path::PathBuf;
use std::sync::Arc;

use courier_common::{
    AssetDescriptor, Attachment, Completion, CorrelationKey, MessageDraft, RequestKind,
    TransferCommand, TransferError, TransferEvent, TransferProgress, TransferState,
    UploadFinished,
};
use tracing::{debug, info, trace, warn};

use super::types::now_timestamp;
use super::{
    EngineContext, EngineError, TransferSnapshot, TransferStateMachine, signal_transition,
};
use crate::transport::Dispatch;

/// Uploads one locally resident attachment together with its message
///
/// No cache short-circuit and no thumbnail states: the bytes are already
/// here, and for images they double as the preview.
#[derive(Debug)]
pub struct UploadEngine {
    asset: AssetDescriptor,
    draft: MessageDraft,
    attachment: Attachment,
    ctx: EngineContext,
    state: TransferState,
    progress: TransferProgress,
    key: Option<CorrelationKey>,
    preview: Option<Arc<[u8]>>,
    remote_url: Option<String>,
    location: Option<PathBuf>,
    error: Option<TransferError>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl UploadEngine {
    pub fn new(
        asset: AssetDescriptor,
        draft: MessageDraft,
        attachment: Attachment,
        ctx: EngineContext,
    ) -> Self {
        let preview = asset
            .is_image()
            .then(|| Arc::from(attachment.bytes.as_slice()));
        Self {
            asset,
            draft,
            attachment,
            ctx,
            state: TransferState::Undefined,
            progress: TransferProgress::default(),
            key: None,
            preview,
            remote_url: None,
            location: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// URL the server assigned to the uploaded object
    pub fn remote_url(&self) -> Option<&str> {
        self.remote_url.as_deref()
    }

    /// Where the uploaded bytes were cached, for file-backed caches
    pub fn location(&self) -> Option<&PathBuf> {
        self.location.as_ref()
    }

    pub fn error(&self) -> Option<TransferError> {
        self.error
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            debug!(hash = %self.asset.hash, from = %self.state, to = %state, "upload state");
            self.state = state;
        }
    }

    fn fail(&mut self, error: TransferError) {
        self.key = None;
        self.error = Some(error);
        self.completed_at = Some(now_timestamp());
        self.set_state(TransferState::Failed);
    }

    /// The server accepted the upload
    fn finish(&mut self, remote_url: Option<String>) {
        // The bytes are local, so a later download of this asset is a cache hit
        match self.ctx.cache.store(&self.asset, &self.attachment.bytes) {
            Ok(()) => self.location = self.ctx.cache.path(&self.asset),
            Err(e) => warn!(hash = %self.asset.hash, error = %e, "failed to cache uploaded asset"),
        }

        self.progress.complete();
        self.remote_url = remote_url.clone();
        self.error = None;
        self.completed_at = Some(now_timestamp());
        self.set_state(TransferState::Completed);
        info!(hash = %self.asset.hash, file = %self.attachment.file_name, "upload finished");

        self.ctx.bus.publish_upload(UploadFinished {
            asset: self.asset.clone(),
            remote_url,
        });
    }
}

impl TransferStateMachine for UploadEngine {
    fn asset(&self) -> &AssetDescriptor {
        &self.asset
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if !self.state.can_start() {
            return Err(EngineError::invalid("start", self.state));
        }

        self.progress.reset();
        self.error = None;
        self.remote_url = None;
        self.location = None;
        self.started_at = Some(now_timestamp());
        self.completed_at = None;

        let key = CorrelationKey::generate();
        let request = RequestKind::SendWithAttachment {
            message: self.draft.clone(),
            attachment: self.attachment.clone(),
        };
        match self.ctx.issue(key.clone(), request) {
            Ok(dispatch) => {
                self.key = Some(key);
                self.set_state(match dispatch {
                    Dispatch::Sent => TransferState::Active,
                    Dispatch::Queued => TransferState::Queued,
                });
                Ok(())
            }
            Err(e) => {
                warn!(hash = %self.asset.hash, error = %e, "failed to issue upload");
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
        self.fail(TransferError::Cancelled);
        Ok(())
    }

    fn on_event(&mut self, event: &TransferEvent) -> bool {
        let key = event.key();
        if self.key.as_ref() != Some(key) {
            trace!(key = %key, "ignoring event for a key this engine doesn't hold");
            return false;
        }

        match event {
            TransferEvent::Completed { outcome, .. } => {
                if self.ctx.store.pop(key).is_none() {
                    trace!(key = %key, "dropping completion for evicted upload");
                    return false;
                }
                self.key = None;
                match outcome {
                    Completion::Failed(error) => self.fail(*error),
                    Completion::Remote(url) => self.finish(Some(url.clone())),
                    Completion::Data(_) | Completion::File(_) => self.finish(None),
                }
                true
            }
            _ if !self.ctx.store.contains(key) => {
                trace!(key = %key, "dropping event for evicted upload");
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

    fn on_timeout(&mut self, key: &CorrelationKey) -> bool {
        if self.key.as_ref() != Some(key) {
            return false;
        }
        self.progress.reset();
        self.fail(TransferError::Timeout);
        true
    }

    fn holds(&self, key: &CorrelationKey) -> bool {
        self.key.as_ref() == Some(key)
    }

    fn held_keys(&self) -> Vec<CorrelationKey> {
        self.key.iter().cloned().collect()
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
}
