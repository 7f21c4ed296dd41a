//! File-backed cache keyed by the SHA-256 of each asset's cache key

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use courier_common::AssetDescriptor;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{CacheError, CacheProbe};
use crate::constants::{APP_DIR_NAME, CACHE_DIR_NAME, PART_SUFFIX};

/// Number of hex characters used for the fan-out directory
const FANOUT_PREFIX_LEN: usize = 2;

/// Content-addressed cache under a root directory
///
/// Layout: `<root>/<first two hex chars>/<sha256 hex>`. Writes go to a
/// `.part` file first and are renamed into place, so a reader never sees a
/// half-written asset.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Use `root` as the cache directory (created lazily on first store)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform cache directory, e.g. `~/.cache/courier/assets`
    pub fn default_root() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join(APP_DIR_NAME).join(CACHE_DIR_NAME))
    }

    /// Open the cache in the platform cache directory
    pub fn open_default() -> Result<Self, CacheError> {
        Self::default_root()
            .map(Self::new)
            .ok_or(CacheError::NoCacheDir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File the asset is stored in (whether or not it exists yet)
    pub fn slot(&self, asset: &AssetDescriptor) -> PathBuf {
        let digest = hex::encode(Sha256::digest(asset.cache_key().as_bytes()));
        self.root.join(&digest[..FANOUT_PREFIX_LEN]).join(digest)
    }
}

impl CacheProbe for DiskCache {
    fn exists(&self, asset: &AssetDescriptor) -> bool {
        self.slot(asset).is_file()
    }

    fn path(&self, asset: &AssetDescriptor) -> Option<PathBuf> {
        let slot = self.slot(asset);
        slot.is_file().then_some(slot)
    }

    fn load(&self, asset: &AssetDescriptor) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.slot(asset)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, asset: &AssetDescriptor, bytes: &[u8]) -> Result<(), CacheError> {
        let slot = self.slot(asset);
        if let Some(parent) = slot.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut part = slot.clone().into_os_string();
        part.push(PART_SUFFIX);
        let part = PathBuf::from(part);

        fs::write(&part, bytes)?;
        if let Err(e) = fs::rename(&part, &slot) {
            let _ = fs::remove_file(&part);
            return Err(e.into());
        }

        debug!(key = %asset.cache_key(), size = bytes.len(), "stored asset in cache");
        Ok(())
    }
}
