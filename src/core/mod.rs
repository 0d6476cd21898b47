//! Core module: event values, dispatcher, module proxies, plugins and context

pub mod event;
pub mod dispatcher;
pub mod proxy;
pub mod plugin;
pub mod context;

pub use event::{handler, squash, Args, Completion, Handler, HandlerFuture};
pub use dispatcher::{Dispatcher, Events, SubscriptionId};
pub use proxy::{Bound, Diagnosis, MethodTable, Methods, ModuleProxy, ProvideKind, Provider};
pub use plugin::{FunctionPlugin, Plugin, PluginMetadata};
pub use context::Context;
