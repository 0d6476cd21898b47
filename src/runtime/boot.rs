//! Boot stages
//!
//! A [`BootStage`] emits its own name and then hands control to its
//! continuation once every prerequisite event has fired at least once.
//! Chaining stages through their continuations gives the application its
//! ordered lifecycle.

use crate::core::dispatcher::Dispatcher;
use crate::core::event::Handler;
use crate::error::{ContextExt, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Work run once a stage is satisfied.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

struct StageState {
    name: String,
    awaiting: Mutex<BTreeSet<String>>,
    next: Mutex<Option<Continuation>>,
}

impl StageState {
    fn satisfy(&self, event: &str) {
        if self.awaiting.lock().remove(event) {
            debug!(stage = %self.name, event, "prerequisite fired");
        }
        self.check();
    }

    fn check(&self) {
        if !self.awaiting.lock().is_empty() {
            return;
        }
        // Taken under the lock, run outside it.
        let next = self.next.lock().take();
        if let Some(next) = next {
            info!(stage = %self.name, "boot stage complete");
            next();
        }
    }
}

/// One named step of the boot sequence.
#[derive(Clone)]
pub struct BootStage {
    dispatcher: Dispatcher,
    state: Arc<StageState>,
}

impl BootStage {
    /// Subscribe to every prerequisite on `dispatcher`. The subscriptions stay
    /// until the dispatcher is torn down.
    pub fn new<I, S>(
        dispatcher: &Dispatcher,
        name: &str,
        awaiting: I,
        next: Option<Continuation>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let awaiting: BTreeSet<String> = awaiting.into_iter().map(Into::into).collect();
        let state = Arc::new(StageState {
            name: name.to_string(),
            awaiting: Mutex::new(awaiting.clone()),
            next: Mutex::new(next),
        });

        for event in awaiting {
            let state = state.clone();
            let fired = event.clone();
            dispatcher.on(
                &event,
                Handler::from_fn(move |_| {
                    state.satisfy(&fired);
                    Ok(None)
                })
                .named("boot-prerequisite"),
            );
        }

        Self {
            dispatcher: dispatcher.clone(),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Prerequisites that have not fired yet.
    pub fn awaiting(&self) -> Vec<String> {
        self.state.awaiting.lock().iter().cloned().collect()
    }

    /// True once the continuation has been handed off, or when there never
    /// was one and nothing is awaited.
    pub fn is_complete(&self) -> bool {
        self.state.awaiting.lock().is_empty() && self.state.next.lock().is_none()
    }

    /// Emit the stage name, wait for the whole emission, then check.
    pub async fn execute(&self) -> Result<Option<Value>> {
        info!(stage = %self.state.name, "boot stage");
        let result = self
            .dispatcher
            .emit(&self.state.name, Vec::new())
            .await
            .with_event(&self.state.name)?;
        self.state.check();
        Ok(result)
    }
}

impl std::fmt::Debug for BootStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootStage")
            .field("name", &self.state.name)
            .field("awaiting", &self.awaiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, Continuation) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn test_stage_without_prerequisites() {
        let d = Dispatcher::new();
        let (count, next) = counter();
        let stage = BootStage::new(&d, "init", Vec::<String>::new(), Some(next));
        let fired = d.once("init", None);
        stage.execute().await.unwrap();
        fired.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(stage.is_complete());
    }

    #[tokio::test]
    async fn test_prerequisites_in_any_order() {
        let d = Dispatcher::new();
        let (count, next) = counter();
        let stage = BootStage::new(&d, "startup", ["a", "b"], Some(next));
        stage.execute().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(stage.awaiting(), vec!["a", "b"]);

        d.emit("b", args![]).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        d.emit("a", args![]).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_continuation_runs_exactly_once() {
        let d = Dispatcher::new();
        let (count, next) = counter();
        let stage = BootStage::new(&d, "startup", ["a", "b"], Some(next));
        stage.execute().await.unwrap();
        d.emit("a", args![]).await.unwrap();
        d.emit("a", args![]).await.unwrap();
        d.emit("b", args![]).await.unwrap();
        d.emit("b", args![]).await.unwrap();
        stage.execute().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_prerequisite_stalls() {
        let d = Dispatcher::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let stage = BootStage::new(
            &d,
            "load",
            ["never"],
            Some(Box::new(move || {
                let _ = tx.send(());
            })),
        );
        stage.execute().await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), rx).await.is_err());
        assert!(!stage.is_complete());
    }

    #[tokio::test]
    async fn test_stage_without_continuation() {
        let d = Dispatcher::new();
        let stage = BootStage::new(&d, "launch", ["ready"], None);
        stage.execute().await.unwrap();
        d.emit("ready", args![]).await.unwrap();
        assert!(stage.awaiting().is_empty());
        assert!(stage.is_complete());
    }

    #[tokio::test]
    async fn test_execute_reports_handler_failure() {
        let d = Dispatcher::new();
        let (count, next) = counter();
        d.on(
            "config",
            Handler::from_fn(|_| Err(crate::error::BusError::Handler("bad config".into()))),
        );
        let stage = BootStage::new(&d, "config", Vec::<String>::new(), Some(next));
        let err = stage.execute().await.unwrap_err();
        assert_eq!(err.to_string(), "Handler failed: bad config [event: config]");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
