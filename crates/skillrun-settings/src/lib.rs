//! # skillrun-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`Settings::default()`])
//! 2. **User file** `~/.skillrun/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** `SKILLRUN_*` overrides (highest priority)
//!
//! The bearer token is deliberately absent: it is supplied per process
//! (flag or `SKILLRUN_TOKEN`) and never written to disk.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
