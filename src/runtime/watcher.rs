//! Change watching
//!
//! A [`Watcher`] reports changed paths; [`forward_changes`] republishes each
//! one on a dispatcher. Restarting in response is left to whoever listens.

use crate::core::dispatcher::Dispatcher;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default event carrying a changed path.
pub const CHANGE_EVENT: &str = "change.detected";

#[async_trait]
pub trait Watcher: Send + 'static {
    /// Next changed path, or `None` once the watcher is closed.
    async fn next_change(&mut self) -> Option<String>;
}

/// Watcher fed through a channel, for callers that run their own
/// filesystem notification.
pub struct ChannelWatcher {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelWatcher {
    pub fn new() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl Watcher for ChannelWatcher {
    async fn next_change(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Emit `event` with the changed path for every change until the watcher
/// closes.
pub fn forward_changes<W: Watcher>(dispatcher: Dispatcher, mut watcher: W, event: &str) -> JoinHandle<()> {
    let event = event.to_string();
    tokio::spawn(async move {
        while let Some(path) = watcher.next_change().await {
            debug!(event = %event, path = %path, "change detected");
            if let Err(e) = dispatcher.emit(&event, vec![Value::String(path)]).await {
                warn!(event = %event, error = %e, "change handler failed");
            }
        }
        debug!(event = %event, "watcher closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::Handler;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_changes_are_forwarded() {
        let d = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        d.on(
            CHANGE_EVENT,
            Handler::from_fn(move |args| {
                s.lock().push(args[0].clone());
                Ok(None)
            }),
        );

        let (tx, watcher) = ChannelWatcher::new();
        let task = forward_changes(d.clone(), watcher, CHANGE_EVENT);
        tx.send("src/router.rs".to_string()).unwrap();
        tx.send("src/templater.rs".to_string()).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            *seen.lock(),
            vec![Value::from("src/router.rs"), Value::from("src/templater.rs")]
        );
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_watching() {
        let d = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        d.on(
            "change.custom",
            Handler::from_fn(move |args| {
                if args[0] == Value::from("a") {
                    return Err(crate::error::BusError::Handler("flaky".into()));
                }
                s.lock().push(args[0].clone());
                Ok(None)
            }),
        );

        let (tx, watcher) = ChannelWatcher::new();
        let task = forward_changes(d.clone(), watcher, "change.custom");
        tx.send("a".to_string()).unwrap();
        tx.send("b".to_string()).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock(), vec![Value::from("b")]);
    }
}
