//! Error handling system

use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the bus, its modules and the boot sequence.
///
/// `Clone` because a one-shot subscription hands the same outcome both to the
/// emission that fired it and to whoever awaits its completion.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Missing handler method `{method}` for event `{event}`")]
    MissingHandler { event: String, method: String },

    #[error("Plugin load failed: {0}")]
    PluginLoadError(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Completion dropped before settling: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),

    #[error("{0}")]
    Internal(Arc<anyhow::Error>),
}

pub type Result<T> = std::result::Result<T, BusError>;

impl From<anyhow::Error> for BusError {
    fn from(error: anyhow::Error) -> Self {
        BusError::Internal(Arc::new(error))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(error: serde_json::Error) -> Self {
        BusError::ConfigError(error.to_string())
    }
}

/// Attach bus coordinates to an error as it propagates.
pub trait ContextExt<T> {
    fn with_event(self, event: &str) -> Result<T>;
    fn with_module(self, module: &str) -> Result<T>;
}

impl<T> ContextExt<T> for Result<T> {
    fn with_event(self, event: &str) -> Result<T> {
        self.map_err(|e| match e {
            BusError::Handler(msg) => BusError::Handler(format!("{} [event: {}]", msg, event)),
            other => other,
        })
    }

    fn with_module(self, module: &str) -> Result<T> {
        self.map_err(|e| match e {
            BusError::Handler(msg) => BusError::Handler(format!("{} [module: {}]", msg, module)),
            BusError::PluginLoadError(msg) => {
                BusError::PluginLoadError(format!("{} [module: {}]", msg, module))
            }
            other => other,
        })
    }
}
