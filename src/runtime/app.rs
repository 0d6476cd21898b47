//! Application runtime

use crate::core::{Context, Dispatcher, Events, Handler, ModuleProxy, Plugin};
use crate::error::{BusError, Result};
use crate::runtime::boot::{BootStage, Continuation};
use crate::runtime::config::{Config, ConfigProvider};
use crate::runtime::plugin_manager::{PluginLoader, PluginManager, PluginManagerConfig, StaticLoader};
use crate::runtime::watcher::{forward_changes, Watcher, CHANGE_EVENT};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Lifecycle stages in boot order.
pub const BOOT_STAGES: [&str; 5] = ["config", "init", "load", "startup", "launch"];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    pub description: String,
    pub stages: Vec<String>,
    pub plugin_config: PluginManagerConfig,
    pub graceful_shutdown_timeout: Duration,
    /// Suppresses the post-launch module diagnostics.
    pub silent: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "SynapseApp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: String::new(),
            stages: BOOT_STAGES.iter().map(|s| s.to_string()).collect(),
            plugin_config: PluginManagerConfig::default(),
            graceful_shutdown_timeout: Duration::from_secs(30),
            silent: false,
        }
    }
}

impl AppConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_plugin_config(mut self, config: PluginManagerConfig) -> Self {
        self.plugin_config = config;
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Base configuration layer.
    fn defaults(&self) -> Config {
        let mut config = Config::new();
        config.set("appName", Value::String(self.name.clone()));
        config.set("appVersion", Value::String(self.version.clone()));
        config
    }
}

pub struct AppBuilder {
    config: Option<AppConfig>,
    plugins: StaticLoader,
    loaders: Vec<Arc<dyn PluginLoader>>,
    providers: Vec<Arc<dyn ConfigProvider>>,
    dispatcher: Option<Dispatcher>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            plugins: StaticLoader::new(),
            loaders: Vec::new(),
            providers: Vec::new(),
            dispatcher: None,
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn add_plugin<P: Plugin>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn add_plugins<I>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Plugin>>,
    {
        for plugin in plugins {
            self.plugins.push(plugin);
        }
        self
    }

    pub fn add_loader<L: PluginLoader + 'static>(mut self, loader: L) -> Self {
        self.loaders.push(Arc::new(loader));
        self
    }

    /// Providers are merged in the order added, later ones winning.
    pub fn add_provider<C: ConfigProvider + 'static>(mut self, provider: C) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> Application {
        let config = self.config.unwrap_or_default();
        let ctx = Context::new(self.dispatcher.unwrap_or_default());
        ctx.set_silent(config.silent);

        let mut loaders = self.loaders;
        if !self.plugins.is_empty() {
            loaders.insert(0, Arc::new(self.plugins));
        }

        Application {
            config,
            ctx,
            loaders,
            providers: self.providers,
            requirements: Mutex::new(HashMap::new()),
            stages: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

type Settle = Arc<Mutex<Option<oneshot::Sender<Result<()>>>>>;

fn settle(slot: &Settle, outcome: Result<()>) {
    if let Some(tx) = slot.lock().take() {
        let _ = tx.send(outcome);
    }
}

/// Continuation that starts `stage` on the current runtime.
fn advance(stage: BootStage, slot: Settle) -> Continuation {
    Box::new(move || match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = stage.execute().await {
                    warn!(stage = %stage.name(), error = %e, "boot stage failed");
                    settle(&slot, Err(e));
                }
            });
        }
        Err(_) => settle(
            &slot,
            Err(BusError::RuntimeError(
                "No Tokio runtime found. Use #[tokio::main]".to_string(),
            )),
        ),
    })
}

/// Composition root: one dispatcher, one proxy per module, and the boot
/// sequence that drives them.
pub struct Application {
    config: AppConfig,
    ctx: Context,
    loaders: Vec<Arc<dyn PluginLoader>>,
    providers: Vec<Arc<dyn ConfigProvider>>,
    requirements: Mutex<HashMap<String, Vec<String>>>,
    stages: Mutex<Vec<BootStage>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl Application {
    pub fn build() -> AppBuilder {
        AppBuilder::new()
    }

    pub fn new() -> Self {
        AppBuilder::new().build()
    }

    /// The proxy for module `name`, created on first use.
    pub fn get(&self, name: &str) -> ModuleProxy {
        self.ctx.get(name)
    }

    /// Hold `stage` back until `event` has fired. Takes effect at the next
    /// `start`.
    pub fn require(&self, stage: &str, event: &str) {
        self.requirements
            .lock()
            .entry(stage.to_string())
            .or_default()
            .push(event.to_string());
    }

    /// Register plugins, assemble configuration, and run the boot sequence.
    ///
    /// Resolves once the last stage's emission, after phase included, has
    /// completed. Fails with the first stage or plugin error.
    pub async fn start(&self, overrides: Map<String, Value>) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(BusError::RuntimeError("Application already running".to_string()));
        }
        info!(app = %self.config.name, version = %self.config.version, "starting");

        let outcome = self.boot(overrides).await;
        if let Err(e) = &outcome {
            // A retried start must find no registrations from this attempt.
            warn!(app = %self.config.name, error = %e, "start failed, releasing handlers");
            self.ctx.teardown();
            self.stages.lock().clear();
            self.is_running.store(false, Ordering::SeqCst);
        }
        outcome
    }

    async fn boot(&self, overrides: Map<String, Value>) -> Result<()> {
        // Plugins see their config sections while registering.
        let mut config = self.config.defaults();
        for provider in &self.providers {
            debug!(provider = provider.name(), "loading config layer");
            config.merge(provider.provide()?);
        }
        self.ctx.set_config(config);

        let mut manager = PluginManager::with_config(self.config.plugin_config.clone());
        for loader in &self.loaders {
            manager.add_from(loader.as_ref()).await?;
        }
        manager.register_all(&self.ctx).await?;

        // Whatever the config stage produced, then the caller's overrides.
        let ctx = self.ctx.clone();
        drop(self.ctx.once_after(
            "config",
            Handler::from_fn(move |input| {
                let contributed = input.into_iter().next().unwrap_or(Value::Null);
                let overrides = overrides.clone();
                ctx.update_config(|config| {
                    config.merge_value(contributed);
                    config.merge(overrides);
                });
                Ok(None)
            })
            .named("config-merge"),
        ));

        let (tx, rx) = oneshot::channel();
        let slot: Settle = Arc::new(Mutex::new(Some(tx)));
        let Some(first) = self.build_stages(&slot) else {
            return Ok(());
        };

        if let Err(e) = first.execute().await {
            settle(&slot, Err(e));
        }
        let outcome = rx
            .await
            .unwrap_or_else(|_| Err(BusError::Cancelled("boot".to_string())));
        if outcome.is_ok() {
            info!(app = %self.config.name, "launched");
        }
        outcome
    }

    /// Chain the stages back to front and return the first one.
    fn build_stages(&self, slot: &Settle) -> Option<BootStage> {
        let requirements = self.requirements.lock().clone();
        let mut next: Option<BootStage> = None;
        let mut stages = Vec::with_capacity(self.config.stages.len());

        for name in self.config.stages.iter().rev() {
            let continuation: Continuation = match next.take() {
                Some(stage) => advance(stage, slot.clone()),
                None => {
                    let slot = slot.clone();
                    Box::new(move || settle(&slot, Ok(())))
                }
            };
            let awaiting = requirements.get(name).cloned().unwrap_or_default();
            let stage = BootStage::new(self.ctx.dispatcher(), name, awaiting, Some(continuation));
            stages.push(stage.clone());
            next = Some(stage);
        }

        stages.reverse();
        *self.stages.lock() = stages;
        next
    }

    /// Emit `stop`, then release every handler and forget module proxies.
    pub async fn stop(&self) -> Result<()> {
        info!(app = %self.config.name, "stopping");
        let stopped = timeout(
            self.config.graceful_shutdown_timeout,
            self.ctx.emit("stop", Vec::new()),
        )
        .await;

        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }
        self.ctx.teardown();
        self.stages.lock().clear();
        self.is_running.store(false, Ordering::SeqCst);

        match stopped {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(BusError::RuntimeError("Shutdown timeout".to_string())),
        }
    }

    pub async fn restart(&self, overrides: Map<String, Value>) -> Result<()> {
        self.stop().await?;
        self.start(overrides).await
    }

    /// Forward changes from `watcher` as `change.detected` emissions. The
    /// forwarding task ends at `stop`.
    pub fn watch<W: Watcher>(&self, watcher: W) {
        let task = forward_changes(self.ctx.dispatcher().clone(), watcher, CHANGE_EVENT);
        self.watchers.lock().push(task);
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Merged configuration as of the last `config` stage.
    pub fn settings(&self) -> Config {
        self.ctx.config()
    }

    pub fn boot_stages(&self) -> Vec<BootStage> {
        self.stages.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Events for Application {
    fn dispatcher(&self) -> &Dispatcher {
        self.ctx.dispatcher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::core::PluginMetadata;
    use crate::runtime::config::StaticProvider;
    use crate::runtime::watcher::ChannelWatcher;
    use async_trait::async_trait;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn within<F: std::future::Future>(f: F) -> tokio::time::Timeout<F> {
        tokio::time::timeout(Duration::from_secs(2), f)
    }

    struct RouterPlugin {
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Plugin for RouterPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("router", "1.0.0")
        }

        async fn register(&self, ctx: &Context) -> Result<()> {
            let seen = self.seen.clone();
            ctx.get("router").gather(
                "route",
                Handler::from_fn(move |args| {
                    seen.lock().push(args[0].clone());
                    Ok(None)
                }),
            );
            Ok(())
        }
    }

    struct WebPlugin;

    #[async_trait]
    impl Plugin for WebPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("web", "1.0.0").with_dependency("router")
        }

        async fn register(&self, ctx: &Context) -> Result<()> {
            // Queued until load.
            drop(ctx.get("router").provide("route", args!["/home"]));
            Ok(())
        }
    }

    #[test]
    fn test_app_config_builder() {
        let config = AppConfig::new("my-app")
            .with_version("1.0.0")
            .with_description("A test app")
            .with_stages(["init", "launch"])
            .silent(true);

        assert_eq!(config.name, "my-app");
        assert_eq!(config.version, "1.0.0");
        assert_eq!(config.description, "A test app");
        assert_eq!(config.stages, vec!["init", "launch"]);
        assert!(config.silent);
        assert_eq!(AppConfig::default().stages, BOOT_STAGES.to_vec());
    }

    #[tokio::test]
    async fn test_boot_events_fire_in_order() {
        let app = Application::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for stage in BOOT_STAGES {
            let o = order.clone();
            app.on(
                stage,
                Handler::from_fn(move |_| {
                    o.lock().push(stage);
                    Ok(None)
                }),
            );
        }
        within(app.start(Map::new())).await.unwrap().unwrap();
        assert_eq!(*order.lock(), BOOT_STAGES.to_vec());
        assert!(app.is_running());
        assert!(app.boot_stages().iter().all(BootStage::is_complete));
    }

    #[tokio::test]
    async fn test_start_resolves_after_launch_after_phase() {
        let app = Application::new();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        drop(app.once_after(
            "launch",
            crate::core::handler(move |_| {
                let d = d.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    d.store(true, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        ));
        within(app.start(Map::new())).await.unwrap().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_config_precedence() {
        let app = Application::build()
            .with_config(AppConfig::new("config-app"))
            .add_provider(StaticProvider::from_value(json!({"test": {"x": 1}, "port": 3000})))
            .build();
        app.on(
            "config",
            Handler::from_fn(|_| Ok(Some(json!({"test": {"y": "someValue", "z": 1}})))),
        );
        let init_saw = Arc::new(Mutex::new(None));
        let seen = init_saw.clone();
        let ctx = app.context().clone();
        app.on(
            "init",
            Handler::from_fn(move |_| {
                *seen.lock() = ctx.config().get("test").cloned();
                Ok(None)
            }),
        );

        within(app.start(object(json!({"test": {"z": 2}}))))
            .await
            .unwrap()
            .unwrap();

        let expected = json!({"x": 1, "y": "someValue", "z": 2});
        assert_eq!(*init_saw.lock(), Some(expected.clone()));
        let settings = app.settings();
        assert_eq!(settings.get("test"), Some(&expected));
        assert_eq!(settings.get_as::<u16>("port").unwrap(), Some(3000));
        assert_eq!(settings.get_str("appName"), Some("config-app"));
    }

    #[tokio::test]
    async fn test_plugins_provide_at_load() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Application::build()
            .add_plugin(WebPlugin)
            .add_plugin(RouterPlugin { seen: seen.clone() })
            .build();
        within(app.start(Map::new())).await.unwrap().unwrap();
        // The provide was spawned during load; give it a tick to land.
        within(async {
            while seen.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock(), vec![json!("/home")]);
        assert_eq!(app.context().registered_modules(), vec!["router"]);
    }

    #[tokio::test]
    async fn test_require_gates_boot() {
        let app = Arc::new(Application::new());
        app.require("startup", "db.ready");
        let launched = app.once("launch", None);

        let starter = app.clone();
        let booting = tokio::spawn(async move { starter.start(Map::new()).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!booting.is_finished());

        app.emit("db.ready", args![]).await.unwrap();
        within(booting).await.unwrap().unwrap().unwrap();
        within(launched).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stage_failure_fails_start() {
        let app = Application::new();
        app.on(
            "load",
            Handler::from_fn(|_| Err(BusError::Handler("load exploded".into()))),
        );
        let err = within(app.start(Map::new())).await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::Handler(_)));
        assert!(!app.is_running());
    }

    struct FlakyGreeter {
        failed_once: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Plugin for FlakyGreeter {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("greeter", "1.0.0")
        }

        async fn register(&self, ctx: &Context) -> Result<()> {
            ctx.get("greeter")
                .respond("greet", Handler::from_fn(|_| Ok(Some(json!("hi")))));
            let failed_once = self.failed_once.clone();
            ctx.on(
                "load",
                Handler::from_fn(move |_| {
                    if failed_once.swap(true, Ordering::SeqCst) {
                        Ok(None)
                    } else {
                        Err(BusError::Handler("database not ready".into()))
                    }
                }),
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_can_be_retried_after_failure() {
        let app = Application::build()
            .add_plugin(FlakyGreeter {
                failed_once: Arc::new(AtomicBool::new(false)),
            })
            .build();

        assert!(within(app.start(Map::new())).await.unwrap().is_err());
        assert!(app.boot_stages().is_empty());
        assert!(!app.context().is_loaded());

        within(app.start(Map::new())).await.unwrap().unwrap();
        let greeter = app.get("greeter");
        assert_eq!(greeter.dispatcher().listener_count("greet"), 1);
        assert_eq!(
            within(greeter.request("greet", args![])).await.unwrap().unwrap(),
            Some(json!("hi"))
        );
    }

    struct ServerPlugin {
        seen: Arc<Mutex<Option<Value>>>,
    }

    #[async_trait]
    impl Plugin for ServerPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("MyServer", "1.0.0")
                .with_default_config(json!({"port": 3000, "host": "localhost"}))
        }

        async fn register(&self, ctx: &Context) -> Result<()> {
            let seen = self.seen.clone();
            let plugin_ctx = ctx.clone();
            ctx.on(
                "init",
                Handler::from_fn(move |_| {
                    *seen.lock() = Some(plugin_ctx.plugin_config());
                    Ok(None)
                }),
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_plugin_config_section() {
        let seen = Arc::new(Mutex::new(None));
        let app = Application::build()
            .add_provider(StaticProvider::from_value(json!({"my_server": {"host": "0.0.0.0"}})))
            .add_plugin(ServerPlugin { seen: seen.clone() })
            .build();
        app.on(
            "config",
            Handler::from_fn(|_| Ok(Some(json!({"my_server": {"tls": false}})))),
        );

        within(app.start(object(json!({"my_server": {"port": 8080}}))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            *seen.lock(),
            Some(json!({"port": 8080, "host": "0.0.0.0", "tls": false}))
        );
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let app = Application::new();
        within(app.start(Map::new())).await.unwrap().unwrap();
        assert!(app.start(Map::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_releases_handlers() {
        let app = Application::new();
        let router = app.get("router");
        router.gather("route", Handler::noop());
        let stopped = app.once("stop", None);
        within(app.start(Map::new())).await.unwrap().unwrap();

        app.stop().await.unwrap();
        stopped.await.unwrap();
        assert_eq!(router.dispatcher().listener_count("route"), 0);
        assert!(app.context().module_names().is_empty());
        assert_eq!(app.dispatcher().listener_count("launch"), 0);
        assert!(!app.is_running());
    }

    #[tokio::test]
    async fn test_restart_reregisters_plugins() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Application::build()
            .add_plugin(RouterPlugin { seen: seen.clone() })
            .build();
        within(app.start(Map::new())).await.unwrap().unwrap();
        within(app.restart(Map::new())).await.unwrap().unwrap();
        assert!(app.is_running());
        assert_eq!(app.get("router").registered_events(), vec!["route"]);
    }

    #[tokio::test]
    async fn test_watch_emits_change_detected() {
        let app = Application::new();
        let changed = app.once(CHANGE_EVENT, Handler::from_fn(|args| Ok(args.first().cloned())));
        let (tx, watcher) = ChannelWatcher::new();
        app.watch(watcher);
        tx.send("plugins/router".to_string()).unwrap();
        assert_eq!(
            within(changed).await.unwrap().unwrap(),
            Some(json!("plugins/router"))
        );
    }
}
