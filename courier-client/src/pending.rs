//! Pending request tracking for response correlation
//!
//! Outbound requests are registered under a correlation key when they are
//! issued. The response handler later pops the entry to confirm the response
//! still belongs to a live request; entries nobody answers are evicted after a
//! timeout so they cannot leak or leave an engine hanging.
//!
//! All access goes through one lock per store. Request volume is bounded by
//! user actions, so a single serialized map is plenty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use courier_common::{CorrelationKey, DEFAULT_REQUEST_TIMEOUT_SECS};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::Subscription;

/// Capacity of the timeout notification channel
const TIMEOUT_CHANNEL_SIZE: usize = 64;

/// Armed eviction timer for one entry
struct Eviction {
    /// Distinguishes this timer from any earlier timer for the same key
    generation: u64,
    timer: JoinHandle<()>,
}

impl Eviction {
    fn disarm(self) {
        self.timer.abort();
    }
}

struct Entry<R> {
    request: R,
    eviction: Option<Eviction>,
}

impl<R> Entry<R> {
    fn into_request(self) -> R {
        if let Some(eviction) = self.eviction {
            eviction.disarm();
        }
        self.request
    }
}

struct Inner<R> {
    entries: Mutex<HashMap<CorrelationKey, Entry<R>>>,
    next_generation: AtomicU64,
    timeout: Duration,
    timeouts: broadcast::Sender<CorrelationKey>,
}

impl<R> Inner<R> {
    /// Remove `key` if the entry is still the one armed with `generation`
    fn evict(&self, key: &CorrelationKey, generation: u64) {
        let evicted = {
            let mut entries = self
                .entries
                .lock()
                .expect("correlation store lock poisoned");
            let armed_here = entries
                .get(key)
                .and_then(|entry| entry.eviction.as_ref())
                .is_some_and(|eviction| eviction.generation == generation);
            // This task is the timer being removed, so the handle is dropped
            // rather than aborted.
            armed_here && entries.remove(key).is_some()
        };

        if evicted {
            warn!(key = %key, timeout_secs = self.timeout.as_secs(), "request timed out");
            let _ = self.timeouts.send(key.clone());
        }
    }
}

impl<R> Drop for Inner<R> {
    fn drop(&mut self) {
        if let Ok(entries) = self.entries.get_mut() {
            for (_, entry) in entries.drain() {
                if let Some(eviction) = entry.eviction {
                    eviction.disarm();
                }
            }
        }
    }
}

/// Concurrency-safe map from correlation key to the request awaiting a response
///
/// Cloning is cheap and every clone shares the same entries, so one store can
/// be handed to every engine by the composition root.
pub struct CorrelationStore<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for CorrelationStore<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> CorrelationStore<R> {
    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .expect("correlation store lock poisoned")
            .len()
    }

    /// Returns true if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R> std::fmt::Debug for CorrelationStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationStore")
            .field("pending", &self.len())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl<R: Send + 'static> Default for CorrelationStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> CorrelationStore<R> {
    /// Create a store with the default 25 second eviction window
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    /// Create a store with a custom eviction window
    pub fn with_timeout(timeout: Duration) -> Self {
        let (timeouts, _) = broadcast::channel(TIMEOUT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                timeout,
                timeouts,
            }),
        }
    }

    /// The eviction window applied to auto-evicting entries
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Receive the key of every entry evicted by its timer
    pub fn subscribe_timeouts(&self) -> Subscription<CorrelationKey> {
        Subscription::new(self.inner.timeouts.subscribe(), "timeouts")
    }

    /// Track `request` under `key`
    ///
    /// With `auto_evict`, the entry is removed after the store's timeout
    /// unless it is popped or removed first, and a timeout notification
    /// carrying the key is sent. Registering a key that is already present
    /// replaces the entry and its timer.
    pub fn register(&self, key: CorrelationKey, request: R, auto_evict: bool) {
        let mut entries = self
            .inner
            .entries
            .lock()
            .expect("correlation store lock poisoned");

        let eviction = if auto_evict { self.arm(&key) } else { None };
        let previous = entries.insert(key.clone(), Entry { request, eviction });
        drop(entries);

        if let Some(previous) = previous {
            debug!(key = %key, "replaced pending request");
            previous.into_request();
        }
    }

    /// Remove and return the request for `key`
    pub fn pop(&self, key: &CorrelationKey) -> Option<R> {
        let entry = self
            .inner
            .entries
            .lock()
            .expect("correlation store lock poisoned")
            .remove(key);
        entry.map(Entry::into_request)
    }

    /// Remove and return the request for `"<namespace>-<id>"`
    pub fn pop_with_namespace(&self, namespace: &str, id: &str) -> Option<R> {
        self.pop(&CorrelationKey::with_namespace(namespace, id))
    }

    /// Drop the entry for `key`, if any
    ///
    /// Returns true if an entry was removed. Removing an absent key is a no-op.
    pub fn remove(&self, key: &CorrelationKey) -> bool {
        self.pop(key).is_some()
    }

    /// Returns true if `key` is still awaiting a response
    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.inner
            .entries
            .lock()
            .expect("correlation store lock poisoned")
            .contains_key(key)
    }

    /// Returns true if any pending key starts with `prefix`
    pub fn contains_prefixed(&self, prefix: &str) -> bool {
        self.inner
            .entries
            .lock()
            .expect("correlation store lock poisoned")
            .keys()
            .any(|key| key.as_str().starts_with(prefix))
    }

    /// Restart the eviction window of an auto-evicting entry
    ///
    /// Returns false if the key is absent or was registered without
    /// auto-eviction.
    pub fn refresh(&self, key: &CorrelationKey) -> bool {
        let mut entries = self
            .inner
            .entries
            .lock()
            .expect("correlation store lock poisoned");

        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        let Some(previous) = entry.eviction.take() else {
            return false;
        };
        previous.disarm();
        entry.eviction = self.arm(key);
        entry.eviction.is_some()
    }

    /// Drop every pending request (logout or session reset)
    ///
    /// No timeout notifications are sent for cleared entries.
    pub fn clear(&self) {
        let drained: Vec<Entry<R>> = self
            .inner
            .entries
            .lock()
            .expect("correlation store lock poisoned")
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        if !drained.is_empty() {
            debug!(count = drained.len(), "cleared pending requests");
        }
        for entry in drained {
            entry.into_request();
        }
    }

    /// Spawn the eviction timer for `key`
    fn arm(&self, key: &CorrelationKey) -> Option<Eviction> {
        let Ok(runtime) = Handle::try_current() else {
            warn!(key = %key, "no async runtime, request will not auto-evict");
            return None;
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Inner<R>> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        let key = key.clone();

        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.evict(&key, generation);
            }
        });

        Some(Eviction { generation, timer })
    }
}

impl<R: Clone + Send + 'static> CorrelationStore<R> {
    /// Copy of the request for `key`, leaving the entry in place
    pub fn get(&self, key: &CorrelationKey) -> Option<R> {
        self.inner
            .entries
            .lock()
            .expect("correlation store lock poisoned")
            .get(key)
            .map(|entry| entry.request.clone())
    }
}
