//! Model configuration
//!
//! A [`ModelConfig`] is an immutable value describing one named model:
//! which backend kind serves it, the optional system message, and a
//! free-form parameter table the backend interprets (sampling
//! parameters, endpoint model name, and so on). The engine itself never
//! looks inside `params`.
//!
//! `ModelConfig` doubles as the exact-match key for the backend cache,
//! so it is structurally comparable: two configs with identical field
//! values hash and compare equal, floats included (bit-pattern
//! comparison).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use thiserror::Error;

/// Finite enumeration of generation backend kinds. Each kind is bound
/// to a constructor function at startup; see `backend::BackendCache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Networked OpenAI-style chat completions endpoint.
    OpenAi,
    /// In-process inference over a blocking token generator.
    Local,
}

/// A backend parameter value. Restricted to what TOML model tables can
/// express; floats carry manual `Eq`/`Hash` via their bit pattern so
/// the enclosing config stays usable as a cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a == b,
            (ParamValue::Int(a), ParamValue::Int(b)) => a == b,
            (ParamValue::Float(a), ParamValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ParamValue::Str(a), ParamValue::Str(b)) => a == b,
            (ParamValue::List(a), ParamValue::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ParamValue {}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            ParamValue::Bool(v) => v.hash(state),
            ParamValue::Int(v) => v.hash(state),
            ParamValue::Float(v) => v.to_bits().hash(state),
            ParamValue::Str(v) => v.hash(state),
            ParamValue::List(v) => v.hash(state),
        }
    }
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to JSON for splicing into a backend request body.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Bool(v) => serde_json::Value::from(*v),
            ParamValue::Int(v) => serde_json::Value::from(*v),
            ParamValue::Float(v) => serde_json::Value::from(*v),
            ParamValue::Str(v) => serde_json::Value::from(v.clone()),
            ParamValue::List(v) => {
                serde_json::Value::Array(v.iter().map(ParamValue::to_json).collect())
            }
        }
    }
}

/// Immutable configuration for one named model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Display title for pickers and window chrome.
    pub title: String,
    pub backend: BackendKind,
    /// Injected ahead of the conversation, backend-specific placement.
    #[serde(default)]
    pub system_message: Option<String>,
    /// Raw completion mode: no chat turn structure.
    #[serde(default)]
    pub completion: bool,
    /// Backend-specific parameters, passed through opaquely. Any key
    /// in a model table beyond the named fields lands here.
    #[serde(flatten)]
    pub params: BTreeMap<String, ParamValue>,
}

impl ModelConfig {
    pub fn new(title: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            title: title.into(),
            backend,
            system_message: None,
            completion: false,
            params: BTreeMap::new(),
        }
    }

    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    /// String parameter lookup, for keys like `model` or `base_url`.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(ParamValue::as_str)
    }
}

/// Full configuration: one [`ModelConfig`] per model name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: BTreeMap<String, ModelConfig>,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.model.get(name)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}
