//! Event subscriptions with trailing-edge coalescing.
//!
//! Every handler runs on its own small task fed by a channel, so a slow
//! handler never holds up the connection driver or other handlers. The
//! task coalesces bursts: the first event of a burst opens a window of
//! `coalesce_window`; events arriving inside it replace the pending one;
//! when the window closes the handler sees only the latest.
//!
//! ```text
//! events:   a  b   c                 d
//!           |──window──|             |──window──|
//! handler:             c                        d
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::ClientEvent;

/// A subscriber callback.
pub type Handler = Arc<dyn Fn(ClientEvent) + Send + Sync>;

struct Entry {
    id: u64,
    topic: String,
    tx: mpsc::UnboundedSender<ClientEvent>,
    task: JoinHandle<()>,
}

struct Inner {
    window: Duration,
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

/// Topic → handlers.
///
/// Cloning gives another handle to the same registry.
#[derive(Clone)]
pub struct EventRegistry {
    inner: Arc<Inner>,
}

impl EventRegistry {
    /// A zero `coalesce_window` delivers every event, in order.
    pub fn new(coalesce_window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                window: coalesce_window,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers `handler` for `topic`.
    ///
    /// The handler stays installed until [`Subscription::unsubscribe`] is
    /// called; dropping the `Subscription` does not remove it.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(ClientEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(deliver(rx, Arc::new(handler), self.inner.window));
        let topic = topic.into();
        tracing::debug!(id, %topic, "subscribed");

        self.lock().push(Entry {
            id,
            topic,
            tx,
            task,
        });
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Queues `event` for every handler of its topic. Returns how many
    /// handlers it was queued for.
    pub fn emit(&self, event: ClientEvent) -> usize {
        let topic = event.topic();
        self.lock()
            .iter()
            .filter(|e| e.topic == topic)
            .filter(|e| e.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Handlers registered for `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.lock().iter().filter(|e| e.topic == topic).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("window", &self.inner.window)
            .finish_non_exhaustive()
    }
}

/// Disposer for one handler.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Inner>,
}

impl Subscription {
    /// Removes exactly this handler. Events still waiting in its window
    /// are dropped.
    pub fn unsubscribe(self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut entries = inner.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = entries.iter().position(|e| e.id == self.id) {
            let entry = entries.swap_remove(pos);
            entry.task.abort();
            tracing::debug!(id = self.id, topic = %entry.topic, "unsubscribed");
        }
    }
}

async fn deliver(
    mut rx: mpsc::UnboundedReceiver<ClientEvent>,
    handler: Handler,
    window: Duration,
) {
    while let Some(first) = rx.recv().await {
        if window.is_zero() {
            handler(first);
            continue;
        }
        let deadline = Instant::now() + window;
        let mut latest = first;
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => break,
                next = rx.recv() => match next {
                    Some(event) => latest = event,
                    None => break,
                },
            }
        }
        handler(latest);
    }
}
