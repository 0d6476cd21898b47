//! Synapse Bus - promise-style in-process event bus
//!
//! A [`Dispatcher`](core::Dispatcher) runs every emission through before,
//! main and after phases. [`ModuleProxy`](core::ModuleProxy) layers a
//! provide/gather vocabulary on top that waits for the application's `load`
//! stage, and [`BootStage`](runtime::BootStage) chains the lifecycle.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod core;
pub mod runtime;
pub mod error;

pub use serde_json;

pub mod prelude {
    //! Commonly used types and traits

    pub use crate::core::{handler, Args, Completion, Context, Dispatcher, Events, Handler};
    pub use crate::core::{Bound, MethodTable, Methods, ModuleProxy, Provider};
    pub use crate::core::{Plugin, PluginMetadata};
    pub use crate::runtime::{AppBuilder, AppConfig, Application, BootStage};
    pub use crate::runtime::{Config, ConfigProvider, EnvProvider, StaticProvider};
    pub use crate::runtime::{PluginLoader, PluginManagerConfig, StaticLoader};
    pub use crate::error::{BusError, ContextExt, Result};
    pub use crate::{args, plugin_fn};
    pub use async_trait::async_trait;
}

pub use crate::core::{Context, Dispatcher, Events, Handler, ModuleProxy, Plugin};
pub use crate::error::{BusError, Result};
pub use crate::runtime::Application;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

pub fn build_info() -> String {
    format!("Synapse Bus {}", VERSION)
}

pub fn runtime_check() -> Result<()> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(BusError::RuntimeError(
            "No Tokio runtime found. Use #[tokio::main]".to_string(),
        ));
    }
    Ok(())
}
