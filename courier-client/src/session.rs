//! Composition root owning the shared pieces of one signed-in session

use std::sync::Arc;

use courier_common::{
    AssetDescriptor, Attachment, MessageDraft, OutboundRequest, THUMBNAIL_NAMESPACE,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::bus::EventBus;
use crate::cache::{CacheError, CacheProbe, DiskCache};
use crate::pending::CorrelationStore;
use crate::preview::{PreviewPipeline, PreviewTask};
use crate::settings::Settings;
use crate::transfers::{
    DownloadEngine, EngineContext, EngineHandle, UploadEngine, spawn_engine,
};
use crate::transport::Transport;

/// One correlation store, one event bus, and the engines built on them
///
/// The transport publishes its events on [`Session::bus`]. Must be created
/// within a Tokio runtime.
pub struct Session {
    store: CorrelationStore<OutboundRequest>,
    bus: EventBus,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn CacheProbe>,
    previews: PreviewPipeline,
    settings: Settings,
    upload_listener: JoinHandle<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("previews", &self.previews)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<dyn CacheProbe>,
        settings: Settings,
    ) -> Self {
        let store = CorrelationStore::with_timeout(settings.request_timeout());
        let bus = EventBus::new(settings.event_capacity);
        let previews = PreviewPipeline::new(cache.clone(), &settings);
        let upload_listener = previews.track_uploads(&bus);

        Self {
            store,
            bus,
            transport,
            cache,
            previews,
            settings,
            upload_listener,
        }
    }

    /// Create a session caching to `settings.cache_dir`, or the platform
    /// cache directory if unset
    pub fn with_disk_cache(
        transport: Arc<dyn Transport>,
        settings: Settings,
    ) -> Result<Self, CacheError> {
        let cache = match &settings.cache_dir {
            Some(dir) => DiskCache::new(dir.clone()),
            None => DiskCache::open_default()?,
        };
        Ok(Self::new(transport, Arc::new(cache), settings))
    }

    /// Engine for downloading `asset`; nothing is requested until `start`
    pub fn download(&self, asset: AssetDescriptor) -> EngineHandle {
        let engine = DownloadEngine::new(asset, self.context());
        spawn_engine(engine, &self.bus, &self.store)
    }

    /// Engine for sending `attachment` with `draft`; nothing is sent until `start`
    pub fn upload(
        &self,
        asset: AssetDescriptor,
        draft: MessageDraft,
        attachment: Attachment,
    ) -> EngineHandle {
        let engine = UploadEngine::new(asset, draft, attachment, self.context());
        spawn_engine(engine, &self.bus, &self.store)
    }

    /// Apply the preview policy to an image that just became visible
    pub fn observe_image(&self, handle: &EngineHandle) -> Option<PreviewTask> {
        self.previews.observe(handle)
    }

    /// Returns true if any preview request is still awaiting a response
    pub fn has_outstanding_previews(&self) -> bool {
        self.store
            .contains_prefixed(&format!("{THUMBNAIL_NAMESPACE}-"))
    }

    /// Forget every pending request (logout)
    ///
    /// Engines built before the reset should be discarded; responses to their
    /// requests are dropped as stale.
    pub fn reset(&self) {
        info!(pending = self.store.len(), "resetting session");
        self.store.clear();
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &CorrelationStore<OutboundRequest> {
        &self.store
    }

    pub fn previews(&self) -> &PreviewPipeline {
        &self.previews
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn context(&self) -> EngineContext {
        EngineContext {
            store: self.store.clone(),
            transport: self.transport.clone(),
            cache: self.cache.clone(),
            bus: self.bus.clone(),
            image_tier: self.settings.image_tier,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.upload_listener.abort();
    }
}
