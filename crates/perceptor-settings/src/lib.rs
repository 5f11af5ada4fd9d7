//! # perceptor-settings
//!
//! Layered configuration for the Perceptor upload relay.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: `config.json` next to the host (deep-merged over defaults)
//! 3. **Environment variables**: `PERCEPTOR_*` overrides (highest priority)
//!
//! The settings file is created from the compiled defaults when it does not
//! exist yet, so operators always have a complete file to edit.
//!
//! Relative paths inside the file (`uploadPath`, `keyFile`, `certFile`,
//! `indexFile`) resolve against the directory holding the settings file; see
//! [`resolve_path`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, ensure_settings_file, load_settings_from_path, resolve_path,
};
pub use types::{ClientConfig, RelaySettings};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = RelaySettings::default();
        let merged = deep_merge(serde_json::json!({"x": 1}), serde_json::json!({"y": 2}));
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
