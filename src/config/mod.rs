//! Configuration module for flowbench
//!
//! This module handles:
//! - Project files naming a script, its persisted context and side files
//! - Workbench settings (TOML) feeding context and pipeline configuration
//!
//! # Settings Location
//!
//! Settings live in the platform-appropriate config directory:
//! - **Linux**: `~/.config/dev.flowbench/settings.toml`
//! - **macOS**: `~/Library/Application Support/dev.flowbench/settings.toml`
//! - **Windows**: `%APPDATA%\dev.flowbench\settings.toml`
//!
//! # Example
//!
//! ```ignore
//! use flowbench::config::{ProjectFile, WorkbenchSettings};
//!
//! let settings = WorkbenchSettings::load_or_default();
//! let project = ProjectFile::load("demo.flowproj")?;
//! let config = settings.context_config(&project.base_dir)?;
//! ```

pub mod project;
pub mod settings;

pub use project::{ProjectFile, PROJECT_FILE_EXTENSION};
pub use settings::{ScriptModuleSettings, WorkbenchSettings, DEFAULT_LOG_FILTER};

use crate::error::{FlowError, Result};
use std::path::PathBuf;

/// Application identifier for config directories
pub const APP_ID: &str = "dev.flowbench";

/// Settings filename
pub const SETTINGS_FILE: &str = "settings.toml";

/// Directory holding workbench settings.
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Ensure the config directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir()
        .ok_or_else(|| FlowError::Config("Could not determine config directory".to_string()))?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            FlowError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }
    Ok(dir)
}

/// Get the path to the settings file
pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(SETTINGS_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_path_under_app_dir() {
        if let Some(path) = settings_path() {
            assert!(path.ends_with(format!("{APP_ID}/{SETTINGS_FILE}")));
        }
    }
}
