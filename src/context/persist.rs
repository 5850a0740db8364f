//! Saving and restoring root contexts.
//!
//! The core treats a persisted context as bytes; [`ContextSerializer`]
//! turns a [`Context`] into bytes and back. [`JsonContextSerializer`]
//! writes a versioned JSON document.

use super::{Context, ContextConfig, GroupKey};
use crate::error::{FlowError, Result};
use crate::numeric::{Array, DType};
use crate::types::Value;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Current document version.
pub const CONTEXT_FORMAT_VERSION: u32 = 2;

pub trait ContextSerializer {
    fn save(&self, context: &Context) -> Result<Vec<u8>>;

    /// Rebuild a context. `config` supplies the collaborators that are not
    /// part of the persisted data.
    fn load(&self, bytes: &[u8], config: ContextConfig) -> Result<Context>;

    fn save_to_path(&self, context: &Context, path: &Path) -> Result<()> {
        let bytes = self.save(context)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)
            .map_err(|e| FlowError::Io(e).with_context(format!("writing context to {}", path.display())))
    }

    fn load_from_path(&self, path: &Path, config: ContextConfig) -> Result<Context> {
        let bytes = std::fs::read(path)
            .map_err(|e| FlowError::Io(e).with_context(format!("reading context from {}", path.display())))?;
        self.load(&bytes, config)
    }
}

/// Persisted form of a [`Value`]. NaN is stored as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoredValue {
    None,
    Bool {
        value: bool,
    },
    Int {
        value: i64,
    },
    Float {
        value: Option<f64>,
    },
    Str {
        value: String,
    },
    Array {
        shape: Vec<usize>,
        dtype: DType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        units: Option<String>,
        data: Vec<Option<f64>>,
    },
    List {
        items: Vec<StoredValue>,
    },
    Context {
        document: Box<ContextDocument>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContextDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    name: String,
    #[serde(default)]
    entries: IndexMap<String, StoredValue>,
    #[serde(default)]
    expressions: IndexMap<String, String>,
    #[serde(default)]
    item_values: IndexMap<String, f64>,
    /// Named groups; absent in version 1
    #[serde(default)]
    groups: IndexMap<String, Vec<String>>,
    #[serde(default)]
    current_group: Option<String>,
}

fn default_version() -> u32 {
    1
}

fn nan_to_none(v: f64) -> Option<f64> {
    (!v.is_nan()).then_some(v)
}

impl StoredValue {
    fn from_value(name: &str, value: &Value) -> Option<Self> {
        Some(match value {
            Value::None => StoredValue::None,
            Value::Bool(value) => StoredValue::Bool { value: *value },
            Value::Int(value) => StoredValue::Int { value: *value },
            Value::Float(value) => StoredValue::Float {
                value: nan_to_none(*value),
            },
            Value::Str(value) => StoredValue::Str { value: value.clone() },
            Value::Array(array) => StoredValue::Array {
                shape: array.shape().to_vec(),
                dtype: array.dtype(),
                units: array.units().map(str::to_string),
                data: array.iter().map(nan_to_none).collect(),
            },
            Value::List(items) => StoredValue::List {
                items: items
                    .iter()
                    .filter_map(|item| StoredValue::from_value(name, item))
                    .collect(),
            },
            Value::Context(sub) => StoredValue::Context {
                document: Box::new(ContextDocument::capture(sub)),
            },
            Value::Object(object) => {
                warn!(name, kind = object.kind(), "Host objects are not persisted");
                return None;
            }
        })
    }

    fn into_value(self, config: &ContextConfig) -> Result<Value> {
        Ok(match self {
            StoredValue::None => Value::None,
            StoredValue::Bool { value } => Value::Bool(value),
            StoredValue::Int { value } => Value::Int(value),
            StoredValue::Float { value } => Value::Float(value.unwrap_or(f64::NAN)),
            StoredValue::Str { value } => Value::Str(value),
            StoredValue::Array {
                shape,
                dtype,
                units,
                data,
            } => {
                let data = data.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
                let mut array = Array::from_shape_vec(&shape, data, dtype)?;
                array.set_units(units);
                Value::Array(array)
            }
            StoredValue::List { items } => Value::List(
                items
                    .into_iter()
                    .map(|item| item.into_value(config))
                    .collect::<Result<_>>()?,
            ),
            StoredValue::Context { document } => Value::Context(document.restore(config.clone())?),
        })
    }
}

impl ContextDocument {
    fn capture(context: &Context) -> Self {
        let expressions: IndexMap<String, String> = context.expressions().into_iter().collect();
        let entries = context
            .entries()
            .into_iter()
            .filter(|(name, _)| !expressions.contains_key(name))
            .filter_map(|(name, value)| {
                StoredValue::from_value(&name, &value).map(|stored| (name, stored))
            })
            .collect();
        let item_values = context
            .items()
            .into_iter()
            .filter(|item| !item.value.is_nan())
            .map(|item| (item.name, item.value))
            .collect();
        let current_group = match context.current_group() {
            Some(GroupKey::Named(name)) => Some(name),
            _ => None,
        };
        Self {
            version: CONTEXT_FORMAT_VERSION,
            saved_at: Some(Utc::now()),
            name: context.name(),
            entries,
            expressions,
            item_values,
            groups: context.named_groups().into_iter().collect(),
            current_group,
        }
    }

    fn restore(self, config: ContextConfig) -> Result<Context> {
        match self.version {
            CONTEXT_FORMAT_VERSION => {}
            1 => info!(context = %self.name, "Migrating version 1 context document"),
            other => {
                return Err(FlowError::Serialization(format!(
                    "unsupported context document version {other} (expected 1 or {CONTEXT_FORMAT_VERSION})"
                )))
            }
        }

        let context = Context::with_config(&self.name, config.clone());
        let entries = self
            .entries
            .into_iter()
            .map(|(name, stored)| Ok((name, stored.into_value(&config)?)))
            .collect::<Result<Vec<(String, Value)>>>()?;
        context.update(entries)?;
        for (name, source) in &self.expressions {
            context.define_expression(name, source)?;
        }
        for (name, value) in &self.item_values {
            context.set_item_value(name, *value)?;
        }
        if self.version >= 2 {
            for (group, members) in self.groups {
                context.context_group_for(Some(&group), Some(members))?;
            }
            if let Some(group) = &self.current_group {
                context.set_current_group(Some(group))?;
            }
        }
        context.mark_clean();
        Ok(context)
    }
}

/// Versioned JSON documents via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonContextSerializer {
    pub pretty: bool,
}

impl JsonContextSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl ContextSerializer for JsonContextSerializer {
    fn save(&self, context: &Context) -> Result<Vec<u8>> {
        let document = ContextDocument::capture(context);
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(&document)
        } else {
            serde_json::to_vec(&document)
        };
        bytes.map_err(|e| FlowError::Serialization(format!("Failed to serialize context: {e}")))
    }

    fn load(&self, bytes: &[u8], config: ContextConfig) -> Result<Context> {
        let document: ContextDocument = serde_json::from_slice(bytes)
            .map_err(|e| FlowError::Serialization(format!("Failed to parse context document: {e}")))?;
        let context = document.restore(config)?;
        info!(context = %context.name(), entries = context.len(), "Context loaded");
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Context {
        let ctx = Context::new("well");
        ctx.set("depth", Array::from_vec(vec![1.0, f64::NAN, 3.0]).with_units("m"))
            .unwrap();
        ctx.set("gr", vec![10.0, 20.0, 30.0]).unwrap();
        ctx.set("flags", Array::from_bools(vec![true, false, true])).unwrap();
        ctx.set("label", "main").unwrap();
        ctx.set("count", 3).unwrap();
        ctx.set("rows", Value::List(vec![Value::Int(1), Value::Float(2.5)]))
            .unwrap();
        ctx.define_expression("twice", "gr * 2").unwrap();
        ctx.set_item_value("gr", -1.0).unwrap();
        ctx.context_group_for(Some("logs"), Some(vec!["depth".into(), "gr".into()]))
            .unwrap();
        ctx.set_current_group(Some("logs")).unwrap();

        let sub = Context::new("core");
        sub.set("porosity", vec![0.1, 0.2]).unwrap();
        ctx.set("core", sub).unwrap();
        ctx
    }

    #[test]
    fn test_round_trip() {
        let serializer = JsonContextSerializer::pretty();
        let bytes = serializer.save(&sample()).unwrap();
        let loaded = serializer.load(&bytes, ContextConfig::default()).unwrap();

        let depth = loaded.get("depth").unwrap();
        let depth = depth.as_array().unwrap();
        assert_eq!(depth.units(), Some("m"));
        assert!(depth.to_vec()[1].is_nan());
        assert_eq!(
            loaded.get("flags").unwrap().as_array().map(Array::dtype),
            Some(DType::Bool)
        );
        assert_eq!(loaded.get("label").unwrap(), Value::from("main"));
        assert_eq!(loaded.get("count").unwrap(), Value::Int(3));
        assert_eq!(loaded.expressions(), vec![("twice".to_string(), "gr * 2".to_string())]);
        assert_eq!(loaded.item_value("gr").unwrap(), -1.0);
        assert_eq!(loaded.current_group(), Some(GroupKey::Named("logs".into())));
        assert_eq!(
            loaded.get_dotted("core.porosity").unwrap().as_array().map(Array::to_vec),
            Some(vec![0.1, 0.2])
        );
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn test_version_one_migrates_without_groups() {
        let json = r#"{
            "version": 1,
            "name": "old",
            "entries": {"x": {"type": "array", "shape": [2], "dtype": "Float", "data": [1.0, null]}},
            "groups": {"ignored": ["x"]}
        }"#;
        let loaded = JsonContextSerializer::new()
            .load(json.as_bytes(), ContextConfig::default())
            .unwrap();
        assert!(loaded.named_groups().is_empty());
        assert!(loaded.get("x").unwrap().as_array().unwrap().to_vec()[1].is_nan());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let json = r#"{"version": 7, "name": "future"}"#;
        let err = JsonContextSerializer::new()
            .load(json.as_bytes(), ContextConfig::default())
            .unwrap_err();
        assert!(matches!(err, FlowError::Serialization(ref m) if m.contains("version 7")));
    }

    #[test]
    fn test_path_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("ctx.json");
        let serializer = JsonContextSerializer::new();
        serializer.save_to_path(&sample(), &path).unwrap();
        let loaded = serializer.load_from_path(&path, ContextConfig::default()).unwrap();
        assert_eq!(loaded.name(), "well");
        assert!(serializer
            .load_from_path(&dir.path().join("missing.json"), ContextConfig::default())
            .is_err());
    }
}
