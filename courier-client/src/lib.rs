//! Courier Client Library
//!
//! Client-side transfer core for a chat client: correlates outbound
//! requests with their asynchronous responses and drives resumable
//! downloads and uploads over an opaque transport.
//!
//! - [`pending`] - correlation store with timeout eviction
//! - [`bus`] - typed event bus carrying transport events
//! - [`transfers`] - download and upload engines and their driver tasks
//! - [`preview`] - preview fetch policy for images
//! - [`session`] - composition root wiring everything together

pub mod bus;
pub mod cache;
pub mod constants;
pub mod pending;
pub mod preview;
pub mod session;
pub mod settings;
pub mod transfers;
pub mod transport;

pub use bus::{Delivery, EventBus, Subscription};
pub use cache::{CacheError, CacheProbe, DiskCache, MemoryCache};
pub use pending::CorrelationStore;
pub use preview::{PreviewPipeline, PreviewTask};
pub use session::Session;
pub use settings::{Settings, SettingsError};
pub use transfers::{
    DownloadEngine, EngineClosed, EngineContext, EngineError, EngineHandle, PreviewOutcome,
    TransferSnapshot, TransferStateMachine, UploadEngine, WeakEngineHandle, spawn_engine,
};
pub use transport::{Dispatch, Transport, TransportError};
