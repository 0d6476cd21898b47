//! Plugin system

use crate::core::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

/// Descriptive data a plugin ships with, usually read from its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Base of the plugin's config section, see [`Context::plugin_config`].
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub default_config: Value,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            dependencies: Vec::new(),
            default_config: Value::Null,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<impl Into<String>>) -> Self {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_default_config(mut self, defaults: Value) -> Self {
        self.default_config = defaults;
        self
    }

    /// Key of this plugin's section in the application config: the name in
    /// snake case, e.g. `WebServer` and `web-server` both map to `web_server`.
    pub fn config_name(&self) -> String {
        let mut key = String::with_capacity(self.name.len() + 4);
        let mut prev: Option<char> = None;
        for c in self.name.chars() {
            if c == '-' || c == ' ' || c == '.' {
                key.push('_');
            } else if c.is_uppercase() {
                if prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit()) {
                    key.push('_');
                }
                key.extend(c.to_lowercase());
            } else {
                key.push(c);
            }
            prev = Some(c);
        }
        key
    }
}

/// A unit of functionality that wires itself into the bus before boot.
///
/// `register` runs once per application start, before the `config` stage.
/// Implementations typically grab their module proxies from the context and
/// install gather/respond handlers, or queue provides that fire at `load`.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn metadata(&self) -> PluginMetadata;

    async fn register(&self, ctx: &Context) -> Result<()>;

    /// Values seeded into this plugin's config section before it registers.
    /// Anything the configuration layers already set for the section wins.
    fn user_config(&self) -> Option<Value> {
        None
    }

    fn name(&self) -> String {
        self.metadata().name
    }

    fn version(&self) -> String {
        self.metadata().version
    }
}

/// Function plugin wrapper
pub struct FunctionPlugin<F> {
    metadata: PluginMetadata,
    func: F,
}

impl<F> FunctionPlugin<F> {
    pub fn new(metadata: PluginMetadata, func: F) -> Self {
        Self { metadata, func }
    }
}

#[async_trait]
impl<F, Fut> Plugin for FunctionPlugin<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    async fn register(&self, ctx: &Context) -> Result<()> {
        (self.func)(ctx.clone()).await
    }
}

#[macro_export]
macro_rules! plugin_fn {
    ($name:expr, $version:expr, $func:expr) => {{
        use $crate::core::plugin::{FunctionPlugin, PluginMetadata};
        let metadata = PluginMetadata::new($name, $version);
        FunctionPlugin::new(metadata, $func)
    }};
    ($metadata:expr, $func:expr) => {{
        use $crate::core::plugin::FunctionPlugin;
        FunctionPlugin::new($metadata, $func)
    }};
}
