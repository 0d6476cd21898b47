//! Plugin manager

use crate::core::{Context, Plugin};
use crate::error::{BusError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Source of plugins to register before boot.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<Arc<dyn Plugin>>>;
}

/// Loader over a fixed list of plugins.
#[derive(Default, Clone)]
pub struct StaticLoader {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<P: Plugin>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn push(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[async_trait]
impl PluginLoader for StaticLoader {
    async fn load(&self) -> Result<Vec<Arc<dyn Plugin>>> {
        Ok(self.plugins.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PluginLoadOrder {
    /// Registration order as added.
    Declared,
    #[default]
    DependencyFirst,
}

#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    pub timeout: Duration,
    pub load_order: PluginLoadOrder,
    pub continue_on_failure: bool,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            load_order: PluginLoadOrder::default(),
            continue_on_failure: false,
        }
    }
}

impl PluginManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_load_order(mut self, order: PluginLoadOrder) -> Self {
        self.load_order = order;
        self
    }

    pub fn continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }
}

/// Collects plugins and registers them against a [`Context`].
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
    config: PluginManagerConfig,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::with_config(PluginManagerConfig::default())
    }

    pub fn with_config(config: PluginManagerConfig) -> Self {
        Self {
            plugins: Vec::new(),
            config,
        }
    }

    pub fn add(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name();
        if self.has_plugin(&name) {
            return Err(BusError::PluginLoadError(format!(
                "Plugin {} already exists",
                name
            )));
        }
        debug!(plugin = %name, "plugin added");
        self.plugins.push(plugin);
        Ok(())
    }

    /// Pull every plugin out of `loader`.
    pub async fn add_from(&mut self, loader: &dyn PluginLoader) -> Result<()> {
        for plugin in loader.load().await? {
            self.add(plugin)?;
        }
        Ok(())
    }

    /// Plugin names in the order they will register.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let declared: Vec<String> = self.plugins.iter().map(|p| p.name()).collect();
        if self.config.load_order == PluginLoadOrder::Declared {
            return Ok(declared);
        }

        let known: HashSet<&str> = declared.iter().map(String::as_str).collect();
        let deps: HashMap<String, Vec<String>> = self
            .plugins
            .iter()
            .map(|p| (p.name(), p.metadata().dependencies))
            .collect();

        for (name, wanted) in &deps {
            if let Some(missing) = wanted.iter().find(|d| !known.contains(d.as_str())) {
                return Err(BusError::PluginNotFound(format!(
                    "{} (required by {})",
                    missing, name
                )));
            }
        }

        let mut resolved: Vec<String> = Vec::new();
        let mut unresolved = declared;
        while !unresolved.is_empty() {
            let before = unresolved.len();
            let mut remaining = Vec::new();
            for name in unresolved {
                let ready = deps
                    .get(&name)
                    .map_or(true, |wanted| wanted.iter().all(|d| resolved.contains(d)));
                if ready {
                    resolved.push(name);
                } else {
                    remaining.push(name);
                }
            }
            if remaining.len() == before {
                return Err(BusError::PluginLoadError(format!(
                    "Circular dependency detected: {:?}",
                    remaining
                )));
            }
            unresolved = remaining;
        }
        Ok(resolved)
    }

    /// Register every plugin in resolved order, each with its own tagged
    /// context and a per-plugin timeout.
    pub async fn register_all(&self, ctx: &Context) -> Result<()> {
        for name in self.resolve_order()? {
            let Some(plugin) = self.plugins.iter().find(|p| p.name() == name) else {
                return Err(BusError::PluginNotFound(name));
            };
            if let Err(e) = self.register_plugin(plugin.as_ref(), ctx).await {
                if !self.config.continue_on_failure {
                    return Err(e);
                }
                warn!(plugin = %name, error = %e, "plugin registration failed, continuing");
            }
        }
        Ok(())
    }

    async fn register_plugin(&self, plugin: &dyn Plugin, ctx: &Context) -> Result<()> {
        let metadata = plugin.metadata();
        let plugin_name = metadata.name.clone();
        let plugin_ctx = ctx.clone().with_plugin(metadata);
        if let Some(user_config) = plugin.user_config() {
            plugin_ctx.set_user_config(user_config);
        }

        match timeout(self.config.timeout, plugin.register(&plugin_ctx)).await {
            Ok(Ok(())) => {
                info!(plugin = %plugin_name, "plugin registered");
                Ok(())
            }
            Ok(Err(e)) => Err(BusError::PluginLoadError(format!(
                "Plugin {} failed to register: {}",
                plugin_name, e
            ))),
            Err(_) => Err(BusError::PluginLoadError(format!(
                "Plugin {} register timeout after {:?}",
                plugin_name, self.config.timeout
            ))),
        }
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name()).collect()
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Dispatcher, Handler, PluginMetadata};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    struct TestPlugin {
        meta: PluginMetadata,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TestPlugin {
        fn new(name: &str, deps: Vec<&str>, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                meta: PluginMetadata::new(name, "1.0.0").with_dependencies(deps),
                log: log.clone(),
            }
        }
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn metadata(&self) -> PluginMetadata {
            self.meta.clone()
        }

        async fn register(&self, ctx: &Context) -> Result<()> {
            assert_eq!(ctx.plugin_name(), self.meta.name);
            self.log.lock().push(self.meta.name.clone());
            ctx.get(&self.meta.name).respond("ping", Handler::noop());
            Ok(())
        }
    }

    struct FailingPlugin;

    #[async_trait]
    impl Plugin for FailingPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("failing", "0.0.1")
        }

        async fn register(&self, _ctx: &Context) -> Result<()> {
            Err(BusError::Other("refused".into()))
        }
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_duplicate_plugin() {
        let log = log();
        let mut manager = PluginManager::new();
        manager.add(Arc::new(TestPlugin::new("test", vec![], &log))).unwrap();
        let result = manager.add(Arc::new(TestPlugin::new("test", vec![], &log)));
        assert!(result.is_err());
        assert_eq!(manager.plugin_count(), 1);
        assert!(manager.has_plugin("test"));
    }

    #[tokio::test]
    async fn test_dependencies_register_first() {
        let log = log();
        let loader = StaticLoader::new()
            .with(TestPlugin::new("web", vec!["router", "templater"], &log))
            .with(TestPlugin::new("router", vec![], &log))
            .with(TestPlugin::new("templater", vec!["router"], &log));
        let mut manager = PluginManager::new();
        manager.add_from(&loader).await.unwrap();

        let ctx = Context::new(Dispatcher::new());
        manager.register_all(&ctx).await.unwrap();
        assert_eq!(*log.lock(), vec!["router", "templater", "web"]);
        assert_eq!(ctx.module_names(), vec!["router", "templater", "web"]);
    }

    #[test]
    fn test_declared_order() {
        let log = log();
        let mut manager = PluginManager::with_config(
            PluginManagerConfig::new().with_load_order(PluginLoadOrder::Declared),
        );
        manager.add(Arc::new(TestPlugin::new("b", vec!["a"], &log))).unwrap();
        manager.add(Arc::new(TestPlugin::new("a", vec![], &log))).unwrap();
        assert_eq!(manager.resolve_order().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let log = log();
        let mut manager = PluginManager::new();
        manager.add(Arc::new(TestPlugin::new("web", vec!["ghost"], &log))).unwrap();
        assert!(matches!(
            manager.resolve_order(),
            Err(BusError::PluginNotFound(_))
        ));
    }

    #[test]
    fn test_dependency_cycle() {
        let log = log();
        let mut manager = PluginManager::new();
        manager.add(Arc::new(TestPlugin::new("a", vec!["b"], &log))).unwrap();
        manager.add(Arc::new(TestPlugin::new("b", vec!["a"], &log))).unwrap();
        manager.add(Arc::new(TestPlugin::new("c", vec![], &log))).unwrap();
        let err = manager.resolve_order().unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }

    struct ConfiguredPlugin;

    #[async_trait]
    impl Plugin for ConfiguredPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("MailQueue", "1.0.0").with_default_config(json!({"retries": 3}))
        }

        fn user_config(&self) -> Option<Value> {
            Some(json!({"batch": 10}))
        }

        async fn register(&self, ctx: &Context) -> Result<()> {
            assert_eq!(ctx.plugin_config(), json!({"retries": 3, "batch": 10}));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_user_config_is_seeded_before_register() {
        let mut manager = PluginManager::new();
        manager.add(Arc::new(ConfiguredPlugin)).unwrap();
        let ctx = Context::new(Dispatcher::new());
        manager.register_all(&ctx).await.unwrap();
        assert_eq!(ctx.config().get("mail_queue"), Some(&json!({"batch": 10})));
    }

    #[tokio::test]
    async fn test_registration_failure() {
        let log = log();
        let mut manager = PluginManager::new();
        manager.add(Arc::new(FailingPlugin)).unwrap();
        manager.add(Arc::new(TestPlugin::new("after", vec![], &log))).unwrap();
        let ctx = Context::new(Dispatcher::new());
        assert!(manager.register_all(&ctx).await.is_err());
        assert!(log.lock().is_empty());

        let mut lenient = PluginManager::with_config(PluginManagerConfig::new().continue_on_failure(true));
        lenient.add(Arc::new(FailingPlugin)).unwrap();
        lenient.add(Arc::new(TestPlugin::new("after", vec![], &log))).unwrap();
        lenient.register_all(&ctx).await.unwrap();
        assert_eq!(*log.lock(), vec!["after"]);
    }
}
