//! Application-wide constants
//!
//! Shared constants used across multiple modules.

/// Application directory name (used in config and cache directory paths)
pub const APP_DIR_NAME: &str = "courier";

/// Settings file name
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Subdirectory of the cache directory holding transferred assets
pub const CACHE_DIR_NAME: &str = "assets";

/// Suffix for files still being written
pub const PART_SUFFIX: &str = ".part";
