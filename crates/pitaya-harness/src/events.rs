//! Event recording for assertions.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use pitaya_client::{Event, EventKind};
use tokio::sync::Notify;

/// Thread-safe log of delivered events.
///
/// Register [`EventLog::handler`] with `Client::add_event_handler`, then
/// wait for the kinds a test expects.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    events: Mutex<Vec<Event>>,
    changed: Notify,
}

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback appending to this log.
    pub fn handler(&self) -> impl FnMut(&Event) + Send + 'static {
        let inner = self.inner.clone();
        move |event| {
            inner.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
            inner.changed.notify_waiters();
        }
    }

    /// Events so far, in delivery order.
    pub fn events(&self) -> Vec<Event> {
        self.inner.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Kinds so far, in delivery order.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|event| event.kind).collect()
    }

    /// Wait until `count` events were delivered and return them.
    ///
    /// Returns whatever was delivered if `timeout` passes first.
    pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> Vec<Event> {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let changed = self.inner.changed.notified();
                if self.events().len() >= count {
                    return;
                }
                changed.await;
            }
        })
        .await;
        self.events()
    }

    /// Wait until an event of `kind` was delivered and return it.
    pub async fn wait_for(&self, kind: EventKind, timeout: Duration) -> Option<Event> {
        let found = tokio::time::timeout(timeout, async {
            loop {
                let changed = self.inner.changed.notified();
                if let Some(event) = self.events().into_iter().find(|event| event.kind == kind) {
                    return event;
                }
                changed.await;
            }
        })
        .await;
        found.ok()
    }
}
