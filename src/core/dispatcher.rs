//! Promise-style dispatcher
//!
//! Every emission runs three phases for one logical event:
//!
//! 1. `event.before` handlers fold over the argument list, one at a time.
//! 2. `event` handlers run concurrently on the final arguments and are joined.
//! 3. `event.after` handlers fold over the squashed result, one at a time.
//!
//! Each phase works on a snapshot of its registry taken when the phase starts,
//! so handlers added mid-emission only see later emissions.

use crate::core::event::{after_name, before_name, into_args, squash, Args, Completion, Handler};
use crate::error::{BusError, Result};
use futures::future::{self, join_all, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;
use tokio::sync::oneshot;
use tracing::debug;

/// Identifies one registration so it can be removed with [`Dispatcher::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Registered {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    listeners: RwLock<HashMap<String, Vec<Registered>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, event: &str, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() < before;
        if list.is_empty() {
            listeners.remove(event);
        }
        removed
    }
}

/// Named-event registry with before/main/after phases.
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe persistently. Without a handler a no-op is registered.
    pub fn on(&self, event: &str, handler: impl Into<Option<Handler>>) -> SubscriptionId {
        let handler = handler.into().unwrap_or_else(Handler::noop);
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(event, handler = handler.name(), id = id.0, "subscribe");
        self.inner
            .listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Registered { id, handler });
        id
    }

    /// Subscribe for exactly one emission.
    ///
    /// The registration is removed right before the handler runs. The returned
    /// completion resolves with the handler's outcome, or fails with
    /// [`BusError::Cancelled`] if the registration is torn down first.
    pub fn once(&self, event: &str, handler: impl Into<Option<Handler>>) -> Completion {
        let handler = handler.into().unwrap_or_else(Handler::noop);
        let (tx, rx) = oneshot::channel::<Result<Option<Value>>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        let name = event.to_string();

        let wrapper = Handler::new(move |args| {
            if let Some(inner) = registry.upgrade() {
                inner.remove(&name, id);
            }
            // A racing emission may still hold this handler in its snapshot.
            let Some(tx) = slot.lock().take() else {
                return future::ready(Ok(None)).boxed();
            };
            let pending = handler.call(args);
            async move {
                let outcome = pending.await;
                let _ = tx.send(outcome.clone());
                outcome
            }
            .boxed()
        })
        .named("once");

        debug!(event, id = id.0, "subscribe once");
        self.inner
            .listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Registered { id, handler: wrapper });

        let event = event.to_string();
        async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(BusError::Cancelled(event)),
            }
        }
        .boxed()
    }

    pub fn before(&self, event: &str, handler: Handler) -> SubscriptionId {
        self.on(&before_name(event), handler)
    }

    pub fn after(&self, event: &str, handler: Handler) -> SubscriptionId {
        self.on(&after_name(event), handler)
    }

    pub fn once_before(&self, event: &str, handler: impl Into<Option<Handler>>) -> Completion {
        self.once(&before_name(event), handler)
    }

    pub fn once_after(&self, event: &str, handler: impl Into<Option<Handler>>) -> Completion {
        self.once(&after_name(event), handler)
    }

    /// Remove one registration. Returns `true` if it was still registered.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        self.inner.remove(event, id)
    }

    /// Drop every registration on every event.
    ///
    /// Pending one-shot completions fail with [`BusError::Cancelled`].
    pub fn remove_all_listeners(&self) {
        let drained: Vec<_> = self.inner.listeners.write().drain().collect();
        debug!(events = drained.len(), "removed all listeners");
        // Handlers are dropped here, outside the lock.
        drop(drained);
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .listeners
            .read()
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.listeners.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn snapshot(&self, event: &str) -> Vec<Handler> {
        self.inner
            .listeners
            .read()
            .get(event)
            .map(|list| list.iter().map(|r| r.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Run the three-phase protocol for `event`.
    ///
    /// Resolves with the after phase's final value, or the squashed main-phase
    /// result when no after handler supplied a replacement. Fails with the
    /// first handler error encountered.
    pub fn emit(&self, event: &str, args: Args) -> BoxFuture<'static, Result<Option<Value>>> {
        let dispatcher = self.clone();
        let event = event.to_string();
        async move { dispatcher.run(&event, args, None).await }.boxed()
    }

    /// Like [`Dispatcher::emit`], but `started` fires once every main-phase
    /// handler has been polled for the first time. It is dropped unsent if
    /// the before phase fails.
    pub(crate) fn emit_signalled(
        &self,
        event: &str,
        args: Args,
        started: oneshot::Sender<()>,
    ) -> BoxFuture<'static, Result<Option<Value>>> {
        let dispatcher = self.clone();
        let event = event.to_string();
        async move { dispatcher.run(&event, args, Some(started)).await }.boxed()
    }

    async fn run(&self, event: &str, raw: Args, mut started: Option<oneshot::Sender<()>>) -> Result<Option<Value>> {
        debug!(event, args = raw.len(), "emit");

        let mut args = raw.clone();
        for h in self.snapshot(&before_name(event)) {
            let input = vec![Value::Array(args.clone()), Value::Array(raw.clone())];
            if let Some(next) = h.call(input).await? {
                args = into_args(next);
            }
        }

        let handlers = self.snapshot(event);
        let results: Vec<Option<Value>> = if handlers.is_empty() {
            if let Some(tx) = started.take() {
                let _ = tx.send(());
            }
            args.iter().cloned().map(Some).collect()
        } else {
            // Every sibling is driven to completion before the first failure is reported.
            let mut joined = std::pin::pin!(join_all(handlers.iter().map(|h| h.call(args.clone()))));
            let first = future::poll_fn(|cx| Poll::Ready(joined.as_mut().poll(cx))).await;
            if let Some(tx) = started.take() {
                let _ = tx.send(());
            }
            let outcomes = match first {
                Poll::Ready(outcomes) => outcomes,
                Poll::Pending => joined.await,
            };
            outcomes.into_iter().collect::<Result<_>>()?
        };
        let squashed = squash(results);

        let mut replaced: Option<Value> = None;
        for h in self.snapshot(&after_name(event)) {
            let current = replaced
                .clone()
                .or_else(|| squashed.clone())
                .unwrap_or(Value::Null);
            if let Some(next) = h.call(vec![current, Value::Array(args.clone())]).await? {
                replaced = Some(next);
            }
        }

        Ok(replaced.or(squashed))
    }
}

/// Event vocabulary shared by everything that fronts a [`Dispatcher`].
pub trait Events {
    fn dispatcher(&self) -> &Dispatcher;

    fn on(&self, event: &str, handler: impl Into<Option<Handler>>) -> SubscriptionId {
        self.dispatcher().on(event, handler)
    }

    fn once(&self, event: &str, handler: impl Into<Option<Handler>>) -> Completion {
        self.dispatcher().once(event, handler)
    }

    fn before(&self, event: &str, handler: Handler) -> SubscriptionId {
        self.dispatcher().before(event, handler)
    }

    fn after(&self, event: &str, handler: Handler) -> SubscriptionId {
        self.dispatcher().after(event, handler)
    }

    fn once_before(&self, event: &str, handler: impl Into<Option<Handler>>) -> Completion {
        self.dispatcher().once_before(event, handler)
    }

    fn once_after(&self, event: &str, handler: impl Into<Option<Handler>>) -> Completion {
        self.dispatcher().once_after(event, handler)
    }

    fn off(&self, event: &str, id: SubscriptionId) -> bool {
        self.dispatcher().off(event, id)
    }

    fn emit(&self, event: &str, args: Args) -> BoxFuture<'static, Result<Option<Value>>> {
        self.dispatcher().emit(event, args)
    }
}
