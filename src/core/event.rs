//! Event values and handlers
//!
//! Payloads travel as [`serde_json::Value`]. A handler that has nothing to
//! contribute returns `Ok(None)`, which the dispatcher treats as "no value"
//! when aggregating results and when folding before/after phases.

use crate::error::Result;
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Argument list passed to an emission.
pub type Args = Vec<Value>;

/// Future returned by every handler invocation.
pub type HandlerFuture = BoxFuture<'static, Result<Option<Value>>>;

/// Eventual outcome of a one-shot subscription, a provide call or a spawned
/// emission.
pub type Completion = BoxFuture<'static, Result<Option<Value>>>;

const BEFORE_SUFFIX: &str = ".before";
const AFTER_SUFFIX: &str = ".after";

/// Build the name under which pre-processing handlers for `event` live.
pub fn before_name(event: &str) -> String {
    format!("{event}{BEFORE_SUFFIX}")
}

/// Build the name under which post-processing handlers for `event` live.
pub fn after_name(event: &str) -> String {
    format!("{event}{AFTER_SUFFIX}")
}

/// Build an argument list from anything serializable.
///
/// ```
/// use synapse_bus::args;
/// let args = args![1, "two", [3]];
/// assert_eq!(args.len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::serde_json::Value>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        vec![$($crate::serde_json::json!($arg)),+]
    };
}

type HandlerFn = dyn Fn(Args) -> HandlerFuture + Send + Sync;

/// A cloneable, type-erased event handler.
#[derive(Clone)]
pub struct Handler {
    name: &'static str,
    f: Arc<HandlerFn>,
}

impl Handler {
    /// Wrap a function that already returns a boxed future.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Args) -> HandlerFuture + Send + Sync + 'static,
    {
        Self {
            name: "anonymous",
            f: Arc::new(f),
        }
    }

    /// Wrap a synchronous function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Args) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self::new(move |args| future::ready(f(args)).boxed())
    }

    /// A handler that observes and contributes nothing.
    pub fn noop() -> Self {
        Self::from_fn(|_| Ok(None)).named("noop")
    }

    #[must_use]
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn call(&self, args: Args) -> HandlerFuture {
        (self.f)(args)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("name", &self.name).finish()
    }
}

/// Build a [`Handler`] from an async closure.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    Handler::new(move |args| f(args).boxed())
}

/// Collapse the ordered results of a fan-out into one logical value.
///
/// Missing values are dropped; nothing left yields `None`, a single survivor
/// is unwrapped and several survivors come back as an array.
pub fn squash(results: Vec<Option<Value>>) -> Option<Value> {
    let mut values: Vec<Value> = results.into_iter().flatten().collect();
    match values.len() {
        0 => None,
        1 => values.pop(),
        _ => Some(Value::Array(values)),
    }
}

/// Interpret a before-phase replacement as an argument list.
pub fn into_args(value: Value) -> Args {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}
