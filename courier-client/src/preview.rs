//! Preview fetch policy for images
//!
//! The first time an image is observed without a cached thumbnail, a preview
//! is requested from its engine. Images this client has just uploaded get
//! special treatment: the server needs time to generate the derivative, so
//! the request is delayed, and a "not ready" answer is retried exactly once
//! after the same delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use courier_common::AssetDescriptor;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bus::EventBus;
use crate::cache::CacheProbe;
use crate::settings::Settings;
use crate::transfers::{EngineHandle, PreviewOutcome, WeakEngineHandle};

struct Inner {
    cache: Arc<dyn CacheProbe>,
    retry_delay: Duration,
    recent_window: Duration,
    quality: f32,
    size: u32,
    /// Upload completion time by asset identity
    recent_uploads: Mutex<HashMap<String, Instant>>,
}

impl Inner {
    fn mark_uploaded(&self, asset: &AssetDescriptor) {
        let now = Instant::now();
        let mut recent = self
            .recent_uploads
            .lock()
            .expect("recent uploads lock poisoned");
        recent.retain(|_, at| now.duration_since(*at) < self.recent_window);
        recent.insert(upload_identity(asset), now);
    }

    fn was_recently_uploaded(&self, asset: &AssetDescriptor) -> bool {
        self.recent_uploads
            .lock()
            .expect("recent uploads lock poisoned")
            .get(&upload_identity(asset))
            .is_some_and(|at| at.elapsed() < self.recent_window)
    }
}

/// Every size tier of an image shares one upload
fn upload_identity(asset: &AssetDescriptor) -> String {
    if asset.hash.is_empty() {
        asset.url.clone().unwrap_or_default()
    } else {
        asset.hash.clone()
    }
}

/// Decides when to ask an engine for a preview
#[derive(Clone)]
pub struct PreviewPipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PreviewPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewPipeline")
            .field("retry_delay", &self.inner.retry_delay)
            .field("recent_window", &self.inner.recent_window)
            .field("quality", &self.inner.quality)
            .field("size", &self.inner.size)
            .finish_non_exhaustive()
    }
}

impl PreviewPipeline {
    pub fn new(cache: Arc<dyn CacheProbe>, settings: &Settings) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                retry_delay: settings.preview_retry_delay(),
                recent_window: settings.recent_upload_window(),
                quality: settings.preview_quality(),
                size: settings.preview_size,
                recent_uploads: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record every finished upload announced on `bus`
    ///
    /// The listener stops on its own once the pipeline is dropped and the
    /// next upload arrives; abort the handle to stop it sooner.
    pub fn track_uploads(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut uploads = bus.subscribe_uploads();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(finished) = uploads.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                trace!(hash = %finished.asset.hash, "tracking uploaded asset");
                inner.mark_uploaded(&finished.asset);
            }
        })
    }

    /// Treat `asset` as just uploaded by this client
    pub fn mark_uploaded(&self, asset: &AssetDescriptor) {
        self.inner.mark_uploaded(asset);
    }

    pub fn was_recently_uploaded(&self, asset: &AssetDescriptor) -> bool {
        self.inner.was_recently_uploaded(asset)
    }

    /// React to an image appearing on screen
    ///
    /// Returns `None` when no preview is needed: plain files, images with a
    /// cached thumbnail (the engine loads it itself), and engines that already
    /// show a preview or have the full asset.
    pub fn observe(&self, handle: &EngineHandle) -> Option<PreviewTask> {
        let asset = handle.asset();
        if !asset.is_image() {
            return None;
        }
        if self.inner.cache.exists(&asset.preview()) {
            trace!(hash = %asset.hash, "thumbnail already cached");
            return None;
        }
        let snapshot = handle.snapshot();
        if snapshot.preview.is_some() || snapshot.is_completed() {
            return None;
        }

        let just_uploaded = self.was_recently_uploaded(asset);
        let request = PreviewRequest {
            engine: handle.downgrade(),
            just_uploaded,
            delay: self.inner.retry_delay,
            quality: self.inner.quality,
            size: self.inner.size,
        };
        debug!(hash = %asset.hash, just_uploaded, "scheduling preview");

        Some(PreviewTask {
            task: tokio::spawn(request.run()),
        })
    }
}

/// One scheduled preview fetch
struct PreviewRequest {
    engine: WeakEngineHandle,
    just_uploaded: bool,
    delay: Duration,
    quality: f32,
    size: u32,
}

impl PreviewRequest {
    async fn run(self) -> Option<PreviewOutcome> {
        let attempts = if self.just_uploaded { 2 } else { 1 };
        let mut outcome = None;

        for attempt in 1..=attempts {
            if self.just_uploaded {
                tokio::time::sleep(self.delay).await;
            }

            // Only a weak handle is held while waiting, so discarding the
            // engine ends this task too
            let reply = {
                let engine = self.engine.upgrade()?;
                engine.download_preview(self.quality, self.size).ok()?
            };
            let result = reply.await.unwrap_or(PreviewOutcome::Superseded);
            debug!(
                hash = %self.engine.asset().hash,
                attempt,
                outcome = ?result,
                "preview attempt finished"
            );

            outcome = Some(result);
            if result != PreviewOutcome::NotReady {
                break;
            }
        }
        outcome
    }
}

/// Cancellable preview fetch; dropping it aborts any pending delay or retry
#[derive(Debug)]
pub struct PreviewTask {
    task: JoinHandle<Option<PreviewOutcome>>,
}

impl PreviewTask {
    /// Wait for the final outcome
    ///
    /// `None` if the engine went away or the task was aborted.
    pub async fn finished(mut self) -> Option<PreviewOutcome> {
        (&mut self.task).await.ok().flatten()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PreviewTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfers::testing::{Fixture, fixture};
    use crate::transfers::{DownloadEngine, spawn_engine};
    use courier_common::{
        Completion, SizeTier, THUMBNAIL_NAMESPACE, TransferError, TransferEvent, TransferState,
        UploadFinished,
    };

    const DELAY: Duration = Duration::from_millis(3_000);

    fn image() -> AssetDescriptor {
        AssetDescriptor::image("img", None, SizeTier::Large)
    }

    fn pipeline(fx: &Fixture) -> PreviewPipeline {
        PreviewPipeline::new(fx.cache.clone(), &Settings::default())
    }

    fn spawn(fx: &Fixture, asset: AssetDescriptor) -> EngineHandle {
        spawn_engine(
            DownloadEngine::new(asset, fx.ctx.clone()),
            &fx.ctx.bus,
            &fx.ctx.store,
        )
    }

    fn preview_requests(fx: &Fixture) -> usize {
        fx.transport
            .sent()
            .iter()
            .filter(|request| request.key.is_in(THUMBNAIL_NAMESPACE))
            .count()
    }

    fn answer_preview(fx: &Fixture, outcome: Completion) {
        fx.ctx.bus.publish_transfer(TransferEvent::Completed {
            key: fx.transport.last_key(),
            outcome,
            cached: false,
        });
    }

    #[tokio::test]
    async fn test_files_and_cached_thumbnails_are_skipped() {
        let fx = fixture();
        let pipeline = pipeline(&fx);

        let file = spawn(&fx, AssetDescriptor::file("doc"));
        assert!(pipeline.observe(&file).is_none());

        fx.cache.store(&image().preview(), b"thumb").expect("store");
        let cached = spawn(&fx, image());
        assert!(pipeline.observe(&cached).is_none());
        assert_eq!(preview_requests(&fx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_image_fetches_immediately() {
        let fx = fixture();
        let pipeline = pipeline(&fx);
        let handle = spawn(&fx, image());

        let task = pipeline.observe(&handle).expect("task");
        handle
            .wait_for(|s| s.state == TransferState::ThumbnailActive)
            .await
            .expect("thumbnail active");

        answer_preview(&fx, Completion::Data(b"thumb".to_vec()));
        assert_eq!(task.finished().await, Some(PreviewOutcome::Ready));
        assert_eq!(handle.state(), TransferState::ThumbnailReady);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_without_upload_is_not_retried() {
        let fx = fixture();
        let pipeline = pipeline(&fx);
        let handle = spawn(&fx, image());

        let task = pipeline.observe(&handle).expect("task");
        handle
            .wait_for(|s| s.state == TransferState::ThumbnailActive)
            .await
            .expect("thumbnail active");

        answer_preview(&fx, Completion::Failed(TransferError::NotReady));
        assert_eq!(task.finished().await, Some(PreviewOutcome::NotReady));
        assert_eq!(preview_requests(&fx), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_just_uploaded_image_is_delayed_and_retried_once() {
        let fx = fixture();
        let pipeline = pipeline(&fx);
        pipeline.mark_uploaded(&image());
        let handle = spawn(&fx, image());

        let task = pipeline.observe(&handle).expect("task");
        tokio::time::sleep(DELAY - Duration::from_millis(100)).await;
        assert_eq!(preview_requests(&fx), 0);

        handle
            .wait_for(|s| s.state == TransferState::ThumbnailActive)
            .await
            .expect("first attempt");
        assert_eq!(preview_requests(&fx), 1);
        answer_preview(&fx, Completion::Failed(TransferError::NotReady));
        handle
            .wait_for(|s| s.state == TransferState::Undefined)
            .await
            .expect("first attempt failed");

        tokio::time::sleep(DELAY - Duration::from_millis(100)).await;
        assert_eq!(preview_requests(&fx), 1);

        handle
            .wait_for(|s| s.state == TransferState::ThumbnailActive)
            .await
            .expect("second attempt");
        assert_eq!(preview_requests(&fx), 2);
        answer_preview(&fx, Completion::Failed(TransferError::NotReady));

        // Exactly one retry
        assert_eq!(task.finished().await, Some(PreviewOutcome::NotReady));
        assert_eq!(preview_requests(&fx), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_task_cancels_pending_fetch() {
        let fx = fixture();
        let pipeline = pipeline(&fx);
        pipeline.mark_uploaded(&image());
        let handle = spawn(&fx, image());

        let task = pipeline.observe(&handle).expect("task");
        drop(task);

        tokio::time::sleep(DELAY * 3).await;
        assert_eq!(preview_requests(&fx), 0);
        assert_eq!(handle.state(), TransferState::Undefined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discarded_engine_ends_task() {
        let fx = fixture();
        let pipeline = pipeline(&fx);
        pipeline.mark_uploaded(&image());
        let handle = spawn(&fx, image());

        let task = pipeline.observe(&handle).expect("task");
        drop(handle);

        assert_eq!(task.finished().await, None);
        assert_eq!(preview_requests(&fx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_upload_window_expires() {
        let fx = fixture();
        let pipeline = pipeline(&fx);
        pipeline.mark_uploaded(&image());
        assert!(pipeline.was_recently_uploaded(&image()));

        // Any tier of the same image counts
        assert!(pipeline.was_recently_uploaded(&AssetDescriptor::image(
            "img",
            None,
            SizeTier::Original
        )));

        tokio::time::sleep(Settings::default().recent_upload_window() + DELAY).await;
        assert!(!pipeline.was_recently_uploaded(&image()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_uploads_marks_finished_uploads() {
        let fx = fixture();
        let pipeline = pipeline(&fx);
        let listener = pipeline.track_uploads(&fx.ctx.bus);

        fx.ctx.bus.publish_upload(UploadFinished {
            asset: image(),
            remote_url: None,
        });
        for _ in 0..10 {
            if pipeline.was_recently_uploaded(&image()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(pipeline.was_recently_uploaded(&image()));
        listener.abort();
    }
}
