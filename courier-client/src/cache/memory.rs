//! In-memory cache for ephemeral sessions and tests

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use courier_common::AssetDescriptor;

use super::{CacheError, CacheProbe};

/// Cache holding asset bytes in a map keyed by `AssetDescriptor::cache_key`
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store` calls so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of cached assets
    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheProbe for MemoryCache {
    fn exists(&self, asset: &AssetDescriptor) -> bool {
        self.entries
            .lock()
            .expect("memory cache lock poisoned")
            .contains_key(&asset.cache_key())
    }

    fn path(&self, _asset: &AssetDescriptor) -> Option<PathBuf> {
        None
    }

    fn load(&self, asset: &AssetDescriptor) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self
            .entries
            .lock()
            .expect("memory cache lock poisoned")
            .get(&asset.cache_key())
            .cloned())
    }

    fn store(&self, asset: &AssetDescriptor, bytes: &[u8]) -> Result<(), CacheError> {
        self.entries
            .lock()
            .expect("memory cache lock poisoned")
            .insert(asset.cache_key(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
