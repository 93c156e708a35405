//! Watch fan-out for one registry instance.
//!
//! Senders live in a map guarded by its own lock, never the backend's. Fan-out
//! is non-blocking: a watcher whose channel is full (or whose receiver is gone)
//! is evicted after the pass, which drops its sender and ends its stream. The
//! consumer drains what was buffered and must re-watch.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use kstore_core::{Object, WatchEvent};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub use tokio::sync::mpsc::error::TryRecvError;

struct Slot<T> {
    tx: mpsc::Sender<WatchEvent<T>>,
    /// Only events for objects in this namespace are delivered.
    namespace: Option<String>,
}

struct Shared<T> {
    resource: String,
    buffer: usize,
    next_id: AtomicU64,
    slots: RwLock<FxHashMap<u64, Slot<T>>>,
}

impl<T> Shared<T> {
    /// Remove a watcher; dropping its sender closes the channel. `false` if it was already gone.
    fn remove(&self, id: u64) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let removed = slots.remove(&id).is_some();
        if removed {
            gauge!("watchers_active", slots.len() as f64, "resource" => self.resource.clone());
        }
        removed
    }
}

pub(crate) struct Watchers<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Object> Watchers<T> {
    pub(crate) fn new(resource: String, buffer: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                resource,
                buffer: buffer.max(1),
                next_id: AtomicU64::new(1),
                slots: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    /// Create a watcher, queue `replay` as ADDED events, then start live delivery.
    /// The channel is sized so the replay never blocks.
    pub(crate) fn register(&self, namespace: Option<String>, replay: Vec<T>) -> Watcher<T> {
        let (tx, rx) = mpsc::channel(self.shared.buffer + replay.len());
        for obj in replay {
            if tx.try_send(WatchEvent::added(obj)).is_err() {
                break;
            }
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut slots = self.shared.slots.write().unwrap_or_else(PoisonError::into_inner);
            slots.insert(id, Slot { tx, namespace });
            gauge!("watchers_active", slots.len() as f64, "resource" => self.shared.resource.clone());
        }
        debug!(resource = %self.shared.resource, watcher = id, "watcher registered");
        Watcher { id, rx, shared: Arc::clone(&self.shared), stopped: false }
    }

    /// Fan `event` out. `namespace` is the namespace the object is stored under.
    pub(crate) fn notify(&self, namespace: Option<&str>, event: WatchEvent<T>) {
        let mut stale: Vec<u64> = Vec::new();
        {
            let slots = self.shared.slots.read().unwrap_or_else(PoisonError::into_inner);
            for (id, slot) in slots.iter() {
                if slot.namespace.is_some() && slot.namespace.as_deref() != namespace {
                    continue;
                }
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(resource = %self.shared.resource, watcher = *id, "watcher buffer full; evicting");
                        counter!("watch_events_dropped_total", 1, "resource" => self.shared.resource.clone());
                        stale.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => stale.push(*id),
                }
            }
        }
        for id in stale {
            if self.shared.remove(id) {
                counter!("watch_evictions_total", 1, "resource" => self.shared.resource.clone());
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Consumer handle for one watch. Read events with [`Watcher::recv`] or as a
/// `Stream`; call [`Watcher::stop`] (or drop the handle) to release the slot.
pub struct Watcher<T> {
    id: u64,
    rx: mpsc::Receiver<WatchEvent<T>>,
    shared: Arc<Shared<T>>,
    stopped: bool,
}

impl<T> Watcher<T> {
    pub fn id(&self) -> u64 { self.id }

    /// Next event; `None` once stopped or evicted and the buffer is drained.
    pub async fn recv(&mut self) -> Option<WatchEvent<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<WatchEvent<T>, TryRecvError> {
        self.rx.try_recv()
    }

    /// Unregister and close the channel. Repeated calls are no-ops.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if self.shared.remove(self.id) {
            debug!(resource = %self.shared.resource, watcher = self.id, "watcher stopped");
        }
        self.rx.close();
    }

    pub fn is_stopped(&self) -> bool { self.stopped }
}

impl<T> Unpin for Watcher<T> {}

impl<T> Stream for Watcher<T> {
    type Item = WatchEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
