//! Workbench settings
//!
//! User-level settings stored as TOML under the platform config directory.
//! They feed the construction-time configuration of contexts (fill value,
//! script modules) and the pipeline (deferred-stage delay), plus the log
//! filter used by the CLI.
//!
//! ```toml
//! deferred_delay_ms = 50
//! fill_value = -999.25
//! log_filter = "info,flowbench=debug"
//!
//! [[script_modules]]
//! name = "petro"
//! path = "scripts/petro.rhai"
//! ```

use crate::block::FunctionRegistry;
use crate::context::{ContextConfig, FillDelegate};
use crate::error::{FlowError, Result};
use crate::scripting::ScriptEngine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default log filter for the CLI
pub const DEFAULT_LOG_FILTER: &str = "info,flowbench=debug";

/// Default coalescing delay of deferred stages in milliseconds
pub const DEFAULT_DEFERRED_DELAY_MS: u64 = 50;

/// A rhai source exposed to blocks under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptModuleSettings {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkbenchSettings {
    /// Coalescing delay of deferred stages
    pub deferred_delay_ms: u64,

    /// Substitution value the context delegate supplies; `None` leaves NaN
    pub fill_value: Option<f64>,

    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_filter: String,

    /// Write persisted contexts as indented JSON
    pub pretty_contexts: bool,

    pub script_modules: Vec<ScriptModuleSettings>,
}

impl Default for WorkbenchSettings {
    fn default() -> Self {
        Self {
            deferred_delay_ms: DEFAULT_DEFERRED_DELAY_MS,
            fill_value: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            pretty_contexts: true,
            script_modules: Vec::new(),
        }
    }
}

impl WorkbenchSettings {
    pub fn deferred_delay(&self) -> Duration {
        Duration::from_millis(self.deferred_delay_ms)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Config(format!("Failed to read settings {:?}: {}", path, e))
        })?;
        toml::from_str(&content)
            .map_err(|e| FlowError::Config(format!("Failed to parse settings {:?}: {}", path, e)))
    }

    /// Settings from the default location, or defaults if there are none.
    pub fn load_or_default() -> Self {
        match super::settings_path() {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring unreadable settings");
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Config(format!("Failed to create settings directory: {}", e))
            })?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FlowError::Config(format!("Failed to serialize settings: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| FlowError::Config(format!("Failed to write settings {:?}: {}", path, e)))?;
        debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    /// Standard functions plus the configured script modules. Relative
    /// module paths resolve against `base_dir`.
    pub fn function_registry(&self, base_dir: &Path) -> Result<FunctionRegistry> {
        let mut registry = FunctionRegistry::standard();
        if self.script_modules.is_empty() {
            return Ok(registry);
        }
        let engine = Arc::new(ScriptEngine::new());
        for module in &self.script_modules {
            let path = if module.path.is_absolute() {
                module.path.clone()
            } else {
                base_dir.join(&module.path)
            };
            let source = std::fs::read_to_string(&path).map_err(|e| {
                FlowError::Config(format!("Failed to read script module {:?}: {}", path, e))
            })?;
            registry.load_script_module(&module.name, &source, &engine)?;
        }
        info!(modules = self.script_modules.len(), "Script modules registered");
        Ok(registry)
    }

    /// Context configuration built from these settings.
    pub fn context_config(&self, base_dir: &Path) -> Result<ContextConfig> {
        Ok(ContextConfig::default()
            .with_delegate(FillDelegate::new(self.fill_value))
            .with_functions(self.function_registry(base_dir)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::builtins;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: WorkbenchSettings = toml::from_str("fill_value = -1.0").unwrap();
        assert_eq!(settings.fill_value, Some(-1.0));
        assert_eq!(settings.deferred_delay(), Duration::from_millis(DEFAULT_DEFERRED_DELAY_MS));
        assert_eq!(settings.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg").join("settings.toml");
        let settings = WorkbenchSettings {
            deferred_delay_ms: 10,
            fill_value: Some(-999.25),
            script_modules: vec![ScriptModuleSettings {
                name: "petro".into(),
                path: "petro.rhai".into(),
            }],
            ..Default::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(WorkbenchSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_context_config_loads_modules() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("petro.rhai"), builtins::PETRO).unwrap();
        let settings = WorkbenchSettings {
            fill_value: Some(0.5),
            script_modules: vec![ScriptModuleSettings {
                name: "petro".into(),
                path: "petro.rhai".into(),
            }],
            ..Default::default()
        };
        let config = settings.context_config(dir.path()).unwrap();
        assert!(config.functions.has_module("petro"));
        assert!(config.functions.has_module("numpy"));
        assert_eq!(config.delegate.default_value("anything"), Some(0.5));

        let missing = WorkbenchSettings {
            script_modules: vec![ScriptModuleSettings {
                name: "gone".into(),
                path: "gone.rhai".into(),
            }],
            ..Default::default()
        };
        assert!(missing.context_config(dir.path()).is_err());
    }
}
