//! Shared bus context handed to every component

use crate::core::dispatcher::{Dispatcher, Events};
use crate::core::event::Handler;
use crate::core::plugin::PluginMetadata;
use crate::core::proxy::{KnownModules, ModuleProxy, REGISTERED_MODULE_EVENT};
use crate::error::{BusError, Result};
use crate::runtime::config::{merge_config, Config};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Application-scoped bus state: the application dispatcher, one proxy per
/// module name, and the merged configuration.
///
/// Cheap to clone. Clones share everything except the plugin tag set by
/// [`Context::with_plugin`].
#[derive(Clone)]
pub struct Context {
    dispatcher: Dispatcher,
    modules: Arc<RwLock<HashMap<String, ModuleProxy>>>,
    known_modules: KnownModules,
    config: Arc<RwLock<Config>>,
    silent: Arc<AtomicBool>,
    loaded: Arc<AtomicBool>,
    plugin_meta: Option<Arc<PluginMetadata>>,
}

impl Context {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let ctx = Self {
            dispatcher,
            modules: Arc::new(RwLock::new(HashMap::new())),
            known_modules: KnownModules::default(),
            config: Arc::new(RwLock::new(Config::new())),
            silent: Arc::new(AtomicBool::new(false)),
            loaded: Arc::new(AtomicBool::new(false)),
            plugin_meta: None,
        };
        ctx.track_registrations();
        ctx
    }

    pub fn with_plugin(self, plugin_meta: PluginMetadata) -> Self {
        Self {
            plugin_meta: Some(Arc::new(plugin_meta)),
            ..self
        }
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin_meta
            .as_ref()
            .map(|meta| meta.name.as_str())
            .unwrap_or("core")
    }

    /// This plugin's configuration: its declared defaults deep-merged with
    /// the application config section named by
    /// [`PluginMetadata::config_name`]. An empty object outside a plugin.
    pub fn plugin_config(&self) -> Value {
        let Some(meta) = &self.plugin_meta else {
            return Value::Object(Map::new());
        };
        let mut section = match &meta.default_config {
            Value::Null => Value::Object(Map::new()),
            defaults => defaults.clone(),
        };
        if let Some(overlay) = self.config.read().get(&meta.config_name()) {
            merge_config(&mut section, overlay.clone());
        }
        section
    }

    pub fn plugin_config_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.plugin_config())
            .map_err(|e| BusError::ConfigError(format!("plugin `{}`: {}", self.plugin_name(), e)))
    }

    /// Seed this plugin's config section. Values already present win.
    pub fn set_user_config(&self, user_config: Value) {
        let Some(meta) = &self.plugin_meta else {
            return;
        };
        let key = meta.config_name();
        self.update_config(|config| {
            let mut section = user_config;
            if let Some(existing) = config.get(&key) {
                merge_config(&mut section, existing.clone());
            }
            config.set(key, section);
        });
    }

    /// The proxy for `name`, created on first use.
    pub fn get(&self, name: &str) -> ModuleProxy {
        if let Some(proxy) = self.modules.read().get(name) {
            return proxy.clone();
        }
        let mut modules = self.modules.write();
        modules
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(module = name, plugin = self.plugin_name(), "creating module proxy");
                let proxy = ModuleProxy::new(&self.dispatcher, name, self.known_modules.clone());
                proxy.set_silent(self.silent.load(Ordering::SeqCst));
                if self.loaded.load(Ordering::SeqCst) {
                    proxy.mark_loaded();
                }
                proxy
            })
            .clone()
    }

    /// Silence post-launch diagnostics on current and future proxies.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
        for proxy in self.modules.read().values() {
            proxy.set_silent(silent);
        }
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Modules that have registered at least one gather/respond handler.
    pub fn registered_modules(&self) -> Vec<String> {
        self.known_modules.read().iter().cloned().collect()
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: Config) {
        *self.config.write() = config;
    }

    pub fn update_config<F>(&self, f: F)
    where
        F: FnOnce(&mut Config),
    {
        f(&mut self.config.write());
    }

    /// Look up one configuration entry and deserialize it.
    pub fn config_value<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .read()
            .get_as(key)?
            .ok_or_else(|| BusError::ConfigError(format!("missing key `{}`", key)))
    }

    /// Release every handler on the application dispatcher and on every
    /// module, and forget all module proxies.
    pub fn teardown(&self) {
        let modules: Vec<ModuleProxy> = self.modules.write().drain().map(|(_, p)| p).collect();
        for module in &modules {
            module.dispatcher().remove_all_listeners();
        }
        self.dispatcher.remove_all_listeners();
        self.known_modules.write().clear();
        self.loaded.store(false, Ordering::SeqCst);
        debug!(modules = modules.len(), "context torn down");
        self.track_registrations();
    }

    fn track_registrations(&self) {
        let known = self.known_modules.clone();
        self.dispatcher.on(
            REGISTERED_MODULE_EVENT,
            Handler::from_fn(move |args| {
                if let Some(name) = args.first().and_then(|v| v.as_str()) {
                    known.write().insert(name.to_string());
                }
                Ok(None)
            })
            .named("track-registrations"),
        );

        // Also covers proxies created after this emission took its
        // `load.before` snapshot.
        let loaded = self.loaded.clone();
        let modules: Weak<RwLock<HashMap<String, ModuleProxy>>> = Arc::downgrade(&self.modules);
        self.dispatcher.before(
            "load",
            Handler::from_fn(move |_| {
                let Some(modules) = modules.upgrade() else {
                    return Ok(None);
                };
                let modules = modules.read();
                loaded.store(true, Ordering::SeqCst);
                for proxy in modules.values() {
                    proxy.mark_loaded();
                }
                Ok(None)
            })
            .named("context-loaded"),
        );
    }

    /// Whether the application has entered its `load` stage.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }
}

impl Events for Context {
    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}
