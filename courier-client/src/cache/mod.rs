//! Local content-addressed asset cache
//!
//! Engines consult the cache before issuing a network request and write to it
//! after a successful transfer. Eviction policy belongs to whoever owns the
//! cache directory; nothing here deletes entries.

mod disk;
mod memory;

use std::io;
use std::path::{Path, PathBuf};

use courier_common::AssetDescriptor;
use thiserror::Error;

pub use disk::DiskCache;
pub use memory::MemoryCache;

/// Cache read/write failure
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("no cache directory available")]
    NoCacheDir,
}

/// Lookup and storage of locally resident assets
pub trait CacheProbe: Send + Sync {
    /// Returns true if the asset is stored locally
    fn exists(&self, asset: &AssetDescriptor) -> bool;

    /// Where the asset lives on disk, for caches backed by files
    fn path(&self, asset: &AssetDescriptor) -> Option<PathBuf>;

    /// Read the stored bytes, or `None` if the asset isn't cached
    fn load(&self, asset: &AssetDescriptor) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store the asset's bytes, replacing any previous copy
    fn store(&self, asset: &AssetDescriptor, bytes: &[u8]) -> Result<(), CacheError>;

    /// Copy a file written by the transport into the cache
    fn import(&self, asset: &AssetDescriptor, source: &Path) -> Result<(), CacheError> {
        let bytes = std::fs::read(source)?;
        self.store(asset, &bytes)
    }
}
