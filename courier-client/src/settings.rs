//! Transfer settings
//!
//! Stored as `settings.json` in the platform config directory. Missing or
//! unreadable files fall back to defaults; missing fields take their default
//! individually so older files keep working.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use courier_common::{DEFAULT_REQUEST_TIMEOUT_SECS, SizeTier};
use thiserror::Error;
use tracing::warn;

use crate::bus::DEFAULT_EVENT_CAPACITY;
use crate::constants::{APP_DIR_NAME, SETTINGS_FILE_NAME};

// =============================================================================
// Constants
// =============================================================================

/// Default delay before fetching the preview of a just-uploaded image
pub const DEFAULT_PREVIEW_RETRY_DELAY_MS: u64 = 3_000;

/// Default window during which an upload counts as "just uploaded"
pub const DEFAULT_RECENT_UPLOAD_WINDOW_SECS: u64 = 120;

/// Default preview encoder quality
pub const DEFAULT_PREVIEW_QUALITY: f32 = 0.5;

/// Default longest edge of a preview in pixels
pub const DEFAULT_PREVIEW_SIZE: u32 = 256;

/// File permissions for the settings file on Unix (owner read/write only)
#[cfg(unix)]
const SETTINGS_FILE_MODE: u32 = 0o600;

// =============================================================================
// Errors
// =============================================================================

/// Failure loading or saving settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine the config directory")]
    NoConfigDir,

    #[error("settings i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// Settings
// =============================================================================

/// Tunables for request correlation, transfers, and previews
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Settings {
    /// Seconds a request may go unanswered before it is evicted
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Delay before (and between) preview fetches for just-uploaded images
    #[serde(default = "default_preview_retry_delay_ms")]
    pub preview_retry_delay_ms: u64,

    /// How long after an upload its asset counts as just uploaded
    #[serde(default = "default_recent_upload_window_secs")]
    pub recent_upload_window_secs: u64,

    /// Preview encoder quality (0.0 to 1.0)
    #[serde(default = "default_preview_quality")]
    pub preview_quality: f32,

    /// Longest edge of requested previews in pixels
    #[serde(default = "default_preview_size")]
    pub preview_size: u32,

    /// Size tier requested for full image downloads without an explicit tier
    #[serde(default = "default_image_tier")]
    pub image_tier: SizeTier,

    /// Events buffered per bus category
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Asset cache directory
    /// Defaults to the platform cache directory if not set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            preview_retry_delay_ms: DEFAULT_PREVIEW_RETRY_DELAY_MS,
            recent_upload_window_secs: DEFAULT_RECENT_UPLOAD_WINDOW_SECS,
            preview_quality: DEFAULT_PREVIEW_QUALITY,
            preview_size: DEFAULT_PREVIEW_SIZE,
            image_tier: default_image_tier(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            cache_dir: None,
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_preview_retry_delay_ms() -> u64 {
    DEFAULT_PREVIEW_RETRY_DELAY_MS
}

fn default_recent_upload_window_secs() -> u64 {
    DEFAULT_RECENT_UPLOAD_WINDOW_SECS
}

fn default_preview_quality() -> f32 {
    DEFAULT_PREVIEW_QUALITY
}

fn default_preview_size() -> u32 {
    DEFAULT_PREVIEW_SIZE
}

fn default_image_tier() -> SizeTier {
    SizeTier::Large
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn preview_retry_delay(&self) -> Duration {
        Duration::from_millis(self.preview_retry_delay_ms)
    }

    pub fn recent_upload_window(&self) -> Duration {
        Duration::from_secs(self.recent_upload_window_secs)
    }

    /// Preview quality clamped to the valid range
    pub fn preview_quality(&self) -> f32 {
        if self.preview_quality.is_finite() {
            self.preview_quality.clamp(0.0, 1.0)
        } else {
            DEFAULT_PREVIEW_QUALITY
        }
    }

    /// Get the platform-specific settings file path
    ///
    /// Returns None if the config directory cannot be determined.
    pub fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
    }

    /// Load settings from disk, or return defaults if not found or invalid
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
                Self::default()
            }
        }
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings to the platform config directory
    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::settings_path().ok_or(SettingsError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Save settings to a specific file with restrictive permissions
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        #[cfg(unix)]
        Self::set_settings_permissions(path)?;

        Ok(())
    }

    /// Set settings file permissions to owner read/write only on Unix systems
    #[cfg(unix)]
    fn set_settings_permissions(path: &Path) -> Result<(), SettingsError> {
        use std::os::unix::fs::PermissionsExt;

        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(SETTINGS_FILE_MODE);
        fs::set_permissions(path, perms)?;
        Ok(())
    }
}
