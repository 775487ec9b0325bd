//! # strata-settings
//!
//! Layered configuration for the Strata memory engine.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`StrataSettings::default()`]
//! 2. **User file**: `~/.strata/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `STRATA_*` and provider variables
//!
//! There is no process-global instance. The binary loads settings once and
//! passes the relevant sections to each service it constructs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, load_with_env, settings_path};
pub use types::*;
