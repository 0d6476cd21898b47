//! Module proxies
//!
//! A [`ModuleProxy`] is the façade one named module exposes on the bus.
//! Producers `gather`/`respond` on it, consumers `provide`/`request` through
//! it, and neither side needs a reference to the other. Provide-style calls
//! made before the application reaches its `load` stage are held back until
//! that stage fires.

use crate::core::dispatcher::{Dispatcher, Events, SubscriptionId};
use crate::core::event::{Args, Completion, Handler};
use crate::error::{BusError, ContextExt, Result};
use futures::future::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Names of modules that have registered at least one handler.
pub type KnownModules = Arc<RwLock<BTreeSet<String>>>;

/// Emitted on the application dispatcher the first time a module registers.
pub const REGISTERED_MODULE_EVENT: &str = "registeredModule";

/// Which phase of the application's `load` emission a deferred provide waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvideKind {
    /// Waits on `load` itself.
    Provide,
    /// Waits on `load.before`, so defaults land ahead of regular provides.
    Default,
    /// Waits on `load.after`, so replacements land behind regular provides.
    Replace,
}

/// One module emission waiting to be started.
struct Job {
    event: String,
    args: Args,
    reply: oneshot::Sender<Result<Option<Value>>>,
}

#[derive(Default)]
struct Held {
    loaded: bool,
    defaults: Vec<Job>,
    provides: Vec<Job>,
    replaces: Vec<Job>,
}

impl Held {
    fn queue(&mut self, kind: ProvideKind) -> &mut Vec<Job> {
        match kind {
            ProvideKind::Default => &mut self.defaults,
            ProvideKind::Provide => &mut self.provides,
            ProvideKind::Replace => &mut self.replaces,
        }
    }
}

/// Starts a module's emissions one after another, in submission order.
///
/// Jobs go through a single channel drained by one task. That task waits
/// until an emission's gatherers have been entered before it starts the next
/// one, so submission order is the order gatherers observe.
struct Launcher {
    module: String,
    events: Dispatcher,
    held: Mutex<Held>,
    pump: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl Launcher {
    fn new(module: &str, events: Dispatcher) -> Self {
        Self {
            module: module.to_string(),
            events,
            held: Mutex::new(Held::default()),
            pump: Mutex::new(None),
        }
    }

    fn is_loaded(&self) -> bool {
        self.held.lock().loaded
    }

    /// Start `job` now if loaded, otherwise hold it for its `load` phase.
    fn enqueue(&self, kind: ProvideKind, job: Job) {
        let mut held = self.held.lock();
        if held.loaded {
            self.submit(job);
        } else {
            debug!(module = %self.module, event = %job.event, ?kind, "deferring until load");
            held.queue(kind).push(job);
        }
    }

    /// Flip to loaded and start the held defaults.
    fn mark_loaded(&self) {
        let mut held = self.held.lock();
        if held.loaded {
            return;
        }
        held.loaded = true;
        for job in std::mem::take(&mut held.defaults) {
            self.submit(job);
        }
    }

    fn release(&self, kind: ProvideKind) {
        let mut held = self.held.lock();
        for job in std::mem::take(held.queue(kind)) {
            self.submit(job);
        }
    }

    // Callers hold `held`, so submissions reach the channel in lock order.
    fn submit(&self, job: Job) {
        let mut pump = self.pump.lock();
        let job = match pump.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // The runtime that hosted the pump is gone.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (tx, rx) = mpsc::unbounded_channel();
                runtime.spawn(run_pump(self.events.clone(), self.module.clone(), rx));
                let _ = tx.send(job);
                *pump = Some(tx);
            }
            Err(_) => {
                let _ = job.reply.send(Err(BusError::RuntimeError(
                    "No Tokio runtime found. Use #[tokio::main]".to_string(),
                )));
            }
        }
    }
}

async fn run_pump(events: Dispatcher, module: String, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let (started_tx, started) = oneshot::channel();
        let emission = events.emit_signalled(&job.event, job.args, started_tx);
        let reply = job.reply;
        let module = module.clone();
        tokio::spawn(async move {
            let _ = reply.send(emission.await.with_module(&module));
        });
        let _ = started.await;
    }
}

/// Outcome of comparing what a module was asked for with what it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnosis {
    Healthy,
    /// Nothing was ever registered on this module.
    NoKnownEvents { known_modules: Vec<String> },
    /// Events that were requested but never registered.
    Missing { missing: Vec<String>, registered: Vec<String> },
}

#[derive(Default)]
struct Ledger {
    requested: BTreeSet<String>,
    registered: BTreeSet<String>,
}

struct ProxyInner {
    name: String,
    app: Dispatcher,
    events: Dispatcher,
    launcher: Arc<Launcher>,
    silent: Arc<AtomicBool>,
    ledger: Arc<Mutex<Ledger>>,
    known_modules: KnownModules,
}

/// Per-module façade over its own [`Dispatcher`].
#[derive(Clone)]
pub struct ModuleProxy {
    inner: Arc<ProxyInner>,
}

impl ModuleProxy {
    /// Create the proxy for `name`, wired to the application dispatcher `app`.
    ///
    /// The proxy flips to loaded on `load.before` and releases held provides
    /// phase by phase. It drops its handlers on `stop` and reports event
    /// mismatches after `launch`.
    pub fn new(app: &Dispatcher, name: &str, known_modules: KnownModules) -> Self {
        let events = Dispatcher::new();
        let launcher = Arc::new(Launcher::new(name, events.clone()));
        let ledger = Arc::new(Mutex::new(Ledger::default()));

        let l = launcher.clone();
        app.before(
            "load",
            Handler::from_fn(move |_| {
                l.mark_loaded();
                Ok(None)
            })
            .named("module-loaded"),
        );
        let l = launcher.clone();
        app.on(
            "load",
            Handler::from_fn(move |_| {
                l.release(ProvideKind::Provide);
                Ok(None)
            })
            .named("module-provides"),
        );
        let l = launcher.clone();
        app.after(
            "load",
            Handler::from_fn(move |_| {
                l.release(ProvideKind::Replace);
                Ok(None)
            })
            .named("module-replaces"),
        );

        let own = events.clone();
        app.on(
            "stop",
            Handler::from_fn(move |_| {
                own.remove_all_listeners();
                Ok(None)
            })
            .named("module-stop"),
        );

        let proxy = Self {
            inner: Arc::new(ProxyInner {
                name: name.to_string(),
                app: app.clone(),
                events,
                launcher,
                silent: Arc::new(AtomicBool::new(false)),
                ledger,
                known_modules,
            }),
        };

        let diagnostics = proxy.diagnostics();
        app.after(
            "launch",
            Handler::from_fn(move |_| {
                diagnostics.report();
                Ok(None)
            })
            .named("module-diagnostics"),
        );

        proxy
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.launcher.is_loaded()
    }

    /// Flip to loaded for a proxy that missed `load.before`.
    pub(crate) fn mark_loaded(&self) {
        self.inner.launcher.mark_loaded();
    }

    /// Suppress the post-launch diagnostics warning.
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::SeqCst);
    }

    pub fn requested_events(&self) -> Vec<String> {
        self.inner.ledger.lock().requested.iter().cloned().collect()
    }

    pub fn registered_events(&self) -> Vec<String> {
        self.inner.ledger.lock().registered.iter().cloned().collect()
    }

    /// Supply `args` to the gatherers of `name`.
    pub fn provide(&self, name: &str, args: Args) -> Completion {
        self.provide_with(ProvideKind::Provide, name, args)
    }

    /// Supply defaults that are processed ahead of regular provides.
    pub fn default(&self, name: &str, args: Args) -> Completion {
        self.provide_with(ProvideKind::Default, name, args)
    }

    pub fn provide_before(&self, name: &str, args: Args) -> Completion {
        self.default(name, args)
    }

    /// Supply replacements that are processed after regular provides.
    pub fn replace(&self, name: &str, args: Args) -> Completion {
        self.provide_with(ProvideKind::Replace, name, args)
    }

    pub fn provide_after(&self, name: &str, args: Args) -> Completion {
        self.replace(name, args)
    }

    /// Ask the responder of `name` for a result.
    pub fn request(&self, name: &str, args: Args) -> Completion {
        self.provide(name, args)
    }

    /// Method-style access: the event name stands in for the method name.
    pub fn call(&self, name: &str, args: Args) -> Completion {
        self.provide(name, args)
    }

    /// Capability that binds the event name at call time, e.g.
    /// `proxy.defaults().call("route", args)`.
    pub fn provider(&self) -> Provider {
        Provider::new(self.clone(), ProvideKind::Provide)
    }

    pub fn defaults(&self) -> Provider {
        Provider::new(self.clone(), ProvideKind::Default)
    }

    pub fn replacer(&self) -> Provider {
        Provider::new(self.clone(), ProvideKind::Replace)
    }

    /// Register `handler` for every value provided under `name`.
    pub fn gather(&self, name: &str, handler: Handler) -> &Self {
        let first = {
            let mut ledger = self.inner.ledger.lock();
            let first = ledger.registered.is_empty();
            ledger.registered.insert(name.to_string());
            first
        };
        if first {
            self.announce();
        }
        self.inner.events.on(name, handler);
        self
    }

    /// Register the responder for requests under `name`.
    pub fn respond(&self, name: &str, handler: Handler) -> &Self {
        self.gather(name, handler)
    }

    /// Let `target` take part in this module's events without holding the
    /// proxy itself. See [`Bound`].
    pub fn use_with<T: Methods>(&self, target: Arc<T>) -> Bound<T> {
        Bound {
            proxy: self.clone(),
            target,
        }
    }

    /// Compare requested events with registered ones.
    pub fn diagnose(&self) -> Diagnosis {
        self.diagnostics().diagnose()
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            name: self.inner.name.clone(),
            silent: self.inner.silent.clone(),
            ledger: self.inner.ledger.clone(),
            known_modules: self.inner.known_modules.clone(),
        }
    }

    fn announce(&self) {
        let name = self.inner.name.clone();
        self.inner.known_modules.write().insert(name.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let app = self.inner.app.clone();
                runtime.spawn(async move {
                    if let Err(e) = app.emit(REGISTERED_MODULE_EVENT, vec![Value::String(name.clone())]).await {
                        warn!(module = %name, error = %e, "module announcement failed");
                    }
                });
            }
            Err(_) => warn!(module = %name, "no runtime, {} not emitted", REGISTERED_MODULE_EVENT),
        }
    }

    fn provide_with(&self, kind: ProvideKind, name: &str, args: Args) -> Completion {
        self.inner.ledger.lock().requested.insert(name.to_string());

        let (reply, rx) = oneshot::channel();
        // Started eagerly so an unawaited provide still reaches its gatherers.
        self.inner.launcher.enqueue(
            kind,
            Job {
                event: name.to_string(),
                args,
                reply,
            },
        );

        let event = name.to_string();
        async move {
            rx.await
                .unwrap_or_else(|_| Err(BusError::Cancelled(event)))
        }
        .boxed()
    }
}

impl Events for ModuleProxy {
    fn dispatcher(&self) -> &Dispatcher {
        &self.inner.events
    }
}

struct Diagnostics {
    name: String,
    silent: Arc<AtomicBool>,
    ledger: Arc<Mutex<Ledger>>,
    known_modules: KnownModules,
}

impl Diagnostics {
    fn diagnose(&self) -> Diagnosis {
        let ledger = self.ledger.lock();
        if ledger.registered.is_empty() {
            return Diagnosis::NoKnownEvents {
                known_modules: self.known_modules.read().iter().cloned().collect(),
            };
        }
        let missing: Vec<String> = ledger
            .requested
            .difference(&ledger.registered)
            .cloned()
            .collect();
        if missing.is_empty() {
            Diagnosis::Healthy
        } else {
            Diagnosis::Missing {
                missing,
                registered: ledger.registered.iter().cloned().collect(),
            }
        }
    }

    fn report(&self) {
        if self.silent.load(Ordering::SeqCst) {
            return;
        }
        match self.diagnose() {
            Diagnosis::Healthy => {}
            Diagnosis::NoKnownEvents { known_modules } => warn!(
                module = %self.name,
                known = %known_modules.join(" "),
                "module has no known events"
            ),
            Diagnosis::Missing { missing, registered } => warn!(
                module = %self.name,
                missing = %missing.join(" "),
                registered = %registered.join(" "),
                "module called with events it never registered"
            ),
        }
    }
}

/// Name-less provide capability returned by [`ModuleProxy::provider`],
/// [`ModuleProxy::defaults`] and [`ModuleProxy::replacer`].
#[derive(Clone)]
pub struct Provider {
    proxy: ModuleProxy,
    kind: ProvideKind,
}

impl Provider {
    fn new(proxy: ModuleProxy, kind: ProvideKind) -> Self {
        Self { proxy, kind }
    }

    pub fn kind(&self) -> ProvideKind {
        self.kind
    }

    pub fn call(&self, name: &str, args: Args) -> Completion {
        self.proxy.provide_with(self.kind, name, args)
    }
}

/// Lookup from event names to handlers, consulted when a [`Bound`] wrapper
/// is called without an explicit handler.
pub trait Methods: Send + Sync + 'static {
    fn method(&self, name: &str) -> Option<Handler>;
}

/// Plain table implementation of [`Methods`].
#[derive(Default, Clone)]
pub struct MethodTable {
    methods: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) {
        self.methods.insert(name.into(), handler);
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl Methods for MethodTable {
    fn method(&self, name: &str) -> Option<Handler> {
        self.methods.get(name).cloned()
    }
}

/// A target object plugged into a module's events.
///
/// Provide-style calls go straight to the proxy. Handler-binding calls take an
/// optional handler and fall back to the target's same-named method.
pub struct Bound<T: Methods> {
    proxy: ModuleProxy,
    target: Arc<T>,
}

impl<T: Methods> Clone for Bound<T> {
    fn clone(&self) -> Self {
        Self {
            proxy: self.proxy.clone(),
            target: self.target.clone(),
        }
    }
}

impl<T: Methods> Bound<T> {
    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    pub fn proxy(&self) -> &ModuleProxy {
        &self.proxy
    }

    fn resolve(&self, event: &str, handler: Option<Handler>) -> Result<Handler> {
        handler
            .or_else(|| self.target.method(event))
            .ok_or_else(|| BusError::MissingHandler {
                event: event.to_string(),
                method: event.to_string(),
            })
    }

    pub fn emit(&self, event: &str, args: Args) -> Completion {
        self.proxy.emit(event, args)
    }

    pub fn provide(&self, name: &str, args: Args) -> Completion {
        self.proxy.provide(name, args)
    }

    pub fn request(&self, name: &str, args: Args) -> Completion {
        self.proxy.request(name, args)
    }

    pub fn default(&self, name: &str, args: Args) -> Completion {
        self.proxy.default(name, args)
    }

    pub fn provide_before(&self, name: &str, args: Args) -> Completion {
        self.proxy.provide_before(name, args)
    }

    pub fn replace(&self, name: &str, args: Args) -> Completion {
        self.proxy.replace(name, args)
    }

    pub fn provide_after(&self, name: &str, args: Args) -> Completion {
        self.proxy.provide_after(name, args)
    }

    pub fn on(&self, event: &str, handler: Option<Handler>) -> Result<&Self> {
        let handler = self.resolve(event, handler)?;
        self.proxy.on(event, handler);
        Ok(self)
    }

    pub fn once(&self, event: &str, handler: Option<Handler>) -> Result<&Self> {
        let handler = self.resolve(event, handler)?;
        // The one-shot stays registered even though nobody awaits its completion.
        drop(self.proxy.once(event, handler));
        Ok(self)
    }

    pub fn gather(&self, event: &str, handler: Option<Handler>) -> Result<&Self> {
        let handler = self.resolve(event, handler)?;
        self.proxy.gather(event, handler);
        Ok(self)
    }

    pub fn respond(&self, event: &str, handler: Option<Handler>) -> Result<&Self> {
        let handler = self.resolve(event, handler)?;
        self.proxy.respond(event, handler);
        Ok(self)
    }

    pub fn before(&self, event: &str, handler: Option<Handler>) -> Result<&Self> {
        let handler = self.resolve(event, handler)?;
        self.proxy.before(event, handler);
        Ok(self)
    }

    pub fn after(&self, event: &str, handler: Option<Handler>) -> Result<&Self> {
        let handler = self.resolve(event, handler)?;
        self.proxy.after(event, handler);
        Ok(self)
    }

    pub fn once_before(&self, event: &str, handler: Option<Handler>) -> Result<&Self> {
        let handler = self.resolve(event, handler)?;
        drop(self.proxy.once_before(event, handler));
        Ok(self)
    }

    pub fn once_after(&self, event: &str, handler: Option<Handler>) -> Result<&Self> {
        let handler = self.resolve(event, handler)?;
        drop(self.proxy.once_after(event, handler));
        Ok(self)
    }

    /// Remove a registration made through this binding.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        self.proxy.off(event, id)
    }
}
