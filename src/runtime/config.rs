//! Configuration map and providers
//!
//! Configuration is a flat key/value map. Layers are merged in order, later
//! layers winning: application defaults, each registered [`ConfigProvider`],
//! values returned by `config` stage handlers, then overrides passed to
//! `start`. Object values are merged deeply.

use crate::error::{BusError, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

/// Key always present in an [`EnvProvider`] layer.
pub const ENVIRONMENT_KEY: &str = "environment";

/// Listening port key, defaulted by [`EnvProvider`] when unset.
pub const PORT_KEY: &str = "PORT";

pub const DEFAULT_PORT: &str = "3000";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    values: Map<String, Value>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Deserialize the entry under `key`, if present.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| BusError::ConfigError(format!("key `{}`: {}", key, e)))
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Merge a layer over this one.
    pub fn merge(&mut self, overlay: Map<String, Value>) {
        for (key, value) in overlay {
            match self.values.get_mut(&key) {
                Some(existing) => merge_config(existing, value),
                None => {
                    self.values.insert(key, value);
                }
            }
        }
    }

    /// Merge a value produced by a `config` stage handler.
    ///
    /// Objects are merged, arrays of objects are merged in order, anything
    /// else is ignored.
    pub fn merge_value(&mut self, value: Value) {
        match value {
            Value::Object(map) => self.merge(map),
            Value::Array(items) => {
                for item in items {
                    self.merge_value(item);
                }
            }
            other => debug!(value = %other, "ignoring non-object config contribution"),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }
}

impl From<Map<String, Value>> for Config {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; any other
/// overlay value replaces the base value.
pub fn merge_config(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_config(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Source of one configuration layer.
pub trait ConfigProvider: Send + Sync {
    fn name(&self) -> &str;

    fn provide(&self) -> Result<Map<String, Value>>;
}

/// Layer built from a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    values: Map<String, Value>,
}

impl StaticProvider {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Build from a JSON object. Anything else yields an empty layer.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(values) => Self { values },
            _ => Self::default(),
        }
    }
}

impl ConfigProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    fn provide(&self) -> Result<Map<String, Value>> {
        Ok(self.values.clone())
    }
}

/// Layer built from environment variables.
///
/// With a prefix, only matching variables are taken and the prefix is
/// stripped. The `environment` key is always set, from `{prefix}ENV` or
/// `APP_ENV`, defaulting to `"dev"`. `PORT` defaults to `"3000"`.
#[derive(Debug, Clone, Default)]
pub struct EnvProvider {
    prefix: Option<String>,
    vars: Option<Vec<(String, String)>>,
}

impl EnvProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Read from the given pairs instead of the process environment.
    pub fn with_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.vars = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        match &self.vars {
            Some(vars) => vars.clone(),
            None => std::env::vars().collect(),
        }
    }
}

impl ConfigProvider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    fn provide(&self) -> Result<Map<String, Value>> {
        let vars = self.snapshot();
        let mut values = Map::new();
        let mut environment = None;

        for (key, value) in vars {
            let key = match &self.prefix {
                Some(prefix) => match key.strip_prefix(prefix.as_str()) {
                    Some(stripped) if !stripped.is_empty() => stripped.to_string(),
                    _ => {
                        if key == "APP_ENV" && environment.is_none() {
                            environment = Some(value);
                        }
                        continue;
                    }
                },
                None => key,
            };
            if key == "ENV" || key == "APP_ENV" {
                environment = Some(value.clone());
            }
            values.insert(key, Value::String(value));
        }

        values.insert(
            ENVIRONMENT_KEY.to_string(),
            Value::String(environment.unwrap_or_else(|| "dev".to_string())),
        );
        values
            .entry(PORT_KEY)
            .or_insert_with(|| Value::String(DEFAULT_PORT.to_string()));
        Ok(values)
    }
}
