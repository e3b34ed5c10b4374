//! Centralized application directory paths for tome.
//!
//! Provides a single source of truth for all filesystem paths used by the
//! engine. Uses the [`dirs`] crate for platform-appropriate directory
//! resolution.
//!
//! # Directory Layout
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | App data | `~/Library/Application Support/tome/` | `~/.local/share/tome/` |
//! | Config | `~/Library/Application Support/tome/` | `~/.config/tome/` |
//! | Cache | `~/Library/Caches/tome/` | `~/.cache/tome/` |
//!
//! # Environment Overrides
//!
//! All paths can be overridden for testing or custom deployments:
//! - `TOME_DATA_DIR` overrides [`data_dir`]
//! - `TOME_CONFIG_DIR` overrides [`config_dir`]
//! - `TOME_CACHE_DIR` overrides [`cache_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Used for persistent user data: the library database, vector index files,
/// and session history.
///
/// Resolves to `dirs::data_dir()/tome/` by default. Override with the
/// `TOME_DATA_DIR` environment variable.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TOME_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("tome"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tome-data"))
}

/// Application config directory.
///
/// Used for `config.toml`.
///
/// Resolves to `dirs::config_dir()/tome/` by default. Override with the
/// `TOME_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TOME_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("tome"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tome-config"))
}

/// Application cache directory.
///
/// Used for downloaded model files and other expendable cached data.
///
/// Resolves to `dirs::cache_dir()/tome/` by default. Override with the
/// `TOME_CACHE_DIR` environment variable.
#[must_use]
pub fn cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TOME_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("tome"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tome-cache"))
}

/// Downloaded model artifacts directory (`cache_dir()/models/`).
#[must_use]
pub fn models_dir() -> PathBuf {
    cache_dir().join("models")
}

/// Vector index files directory (`data_dir()/indices/`).
#[must_use]
pub fn indices_dir() -> PathBuf {
    data_dir().join("indices")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
