//! # copresence-settings
//!
//! Configuration for the co-presence server, loaded in three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`CopresenceSettings::default()`]
//! 2. **Settings file**: `~/.copresence/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `COPRESENCE_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton.
static SETTINGS: OnceLock<CopresenceSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// The first call loads from the default path; if that fails, compiled
/// defaults are used.
pub fn get_settings() -> &'static CopresenceSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            CopresenceSettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: CopresenceSettings) -> std::result::Result<(), CopresenceSettings> {
    SETTINGS.set(settings)
}
