//! Runtime module: boot sequence, application, plugins, configuration and watching

pub mod app;
pub mod boot;
pub mod config;
pub mod plugin_manager;
pub mod watcher;

pub use app::{AppBuilder, AppConfig, Application, BOOT_STAGES};
pub use boot::{BootStage, Continuation};
pub use config::{merge_config, Config, ConfigProvider, EnvProvider, StaticProvider, ENVIRONMENT_KEY, PORT_KEY};
pub use plugin_manager::{PluginLoadOrder, PluginLoader, PluginManager, PluginManagerConfig, StaticLoader};
pub use watcher::{forward_changes, ChannelWatcher, Watcher, CHANGE_EVENT};
