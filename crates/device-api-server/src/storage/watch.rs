use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use error_stack::Report;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use super::Revision;
use super::StorageError;
use super::StorageResult;

/// A change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    pub fn into_object(self) -> T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    /// Wire name of the event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => api_proto::event_type::ADDED,
            WatchEvent::Modified(_) => api_proto::event_type::MODIFIED,
            WatchEvent::Deleted(_) => api_proto::event_type::DELETED,
        }
    }
}

/// Where a new watch begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStart {
    /// Synthetic `Added` for every current object, then live events.
    Snapshot,
    /// Only events strictly after this revision.
    After(Revision),
}

impl WatchStart {
    /// Revision zero and "no revision" both request a snapshot.
    pub fn from_revision(revision: Option<Revision>) -> Self {
        match revision {
            None | Some(0) => WatchStart::Snapshot,
            Some(rev) => WatchStart::After(rev),
        }
    }
}

struct Listener<T> {
    prefix: String,
    tx: mpsc::Sender<WatchEvent<T>>,
    evicted: Arc<AtomicBool>,
}

/// Fan-out from committed writes to per-stream bounded channels.
///
/// Sends never block the writer. A listener whose channel is full is evicted;
/// its stream drains what was buffered and then ends with
/// [`StorageError::WatcherEvicted`].
pub(crate) struct WatcherRegistry<T> {
    listeners: RwLock<HashMap<u64, Listener<T>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl<T: Clone + Send + 'static> WatcherRegistry<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        prefix: String,
        backlog: VecDeque<WatchEvent<T>>,
    ) -> WatchStream<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let evicted = Arc::new(AtomicBool::new(false));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Listener {
                    prefix,
                    tx,
                    evicted: evicted.clone(),
                },
            );
        WatchStream {
            id,
            backlog,
            rx,
            evicted,
            registry: Arc::clone(self),
            done: false,
        }
    }

    /// Delivers `event` to every listener whose prefix covers `key`.
    ///
    /// Returns the number of listeners evicted for being too slow.
    pub(crate) fn publish(&self, key: &str, event: &WatchEvent<T>) -> usize {
        let mut stale = Vec::new();
        {
            let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
            for (id, listener) in listeners.iter() {
                if !key.starts_with(&listener.prefix) {
                    continue;
                }
                match listener.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        listener.evicted.store(true, Ordering::Release);
                        stale.push((*id, true));
                    }
                    Err(TrySendError::Closed(_)) => stale.push((*id, false)),
                }
            }
        }
        if stale.is_empty() {
            return 0;
        }

        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut evicted = 0;
        for (id, was_full) in stale {
            if let Some(listener) = listeners.remove(&id) {
                if was_full {
                    evicted += 1;
                    warn!(watcher = id, prefix = %listener.prefix, "evicting slow watcher");
                }
            }
        }
        evicted
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn remove(&self, id: u64) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// The receiving side of a watch.
///
/// Yields the registration backlog first, then live events. Dropping the
/// stream unregisters it.
pub struct WatchStream<T: Clone + Send + 'static> {
    id: u64,
    backlog: VecDeque<WatchEvent<T>>,
    rx: mpsc::Receiver<WatchEvent<T>>,
    evicted: Arc<AtomicBool>,
    registry: Arc<WatcherRegistry<T>>,
    done: bool,
}

impl<T: Clone + Send + 'static> WatchStream<T> {
    /// Next event; `None` once the stream has ended.
    ///
    /// Cancel safe: dropping the future never loses an event.
    pub async fn next(&mut self) -> Option<StorageResult<WatchEvent<T>>> {
        if self.done {
            return None;
        }
        if let Some(event) = self.backlog.pop_front() {
            return Some(Ok(event));
        }
        match self.rx.recv().await {
            Some(event) => Some(Ok(event)),
            None => {
                self.done = true;
                self.evicted
                    .load(Ordering::Acquire)
                    .then(|| Err(Report::new(StorageError::WatcherEvicted)))
            }
        }
    }

    /// True when nothing is buffered for this stream.
    pub fn is_idle(&self) -> bool {
        self.backlog.is_empty() && self.rx.is_empty()
    }
}

impl<T: Clone + Send + 'static> Drop for WatchStream<T> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn registry(capacity: usize) -> Arc<WatcherRegistry<&'static str>> {
        Arc::new(WatcherRegistry::new(capacity))
    }

    #[tokio::test]
    async fn backlog_precedes_live_events() {
        let registry = registry(8);
        let mut stream = registry.register(
            "/a/".to_string(),
            VecDeque::from([WatchEvent::Added("snapshot")]),
        );

        registry.publish("/a/x", &WatchEvent::Modified("live"));
        registry.publish("/b/x", &WatchEvent::Modified("other prefix"));

        assert_eq!(
            stream.next().await.map(Result::ok),
            Some(Some(WatchEvent::Added("snapshot")))
        );
        assert_eq!(
            stream.next().await.map(Result::ok),
            Some(Some(WatchEvent::Modified("live")))
        );
        assert!(stream.is_idle());
    }

    #[tokio::test]
    async fn slow_watcher_is_evicted_after_draining() {
        // Arrange
        let registry = registry(1);
        let mut stream = registry.register("/".to_string(), VecDeque::new());

        // Act
        assert_eq!(registry.publish("/k", &WatchEvent::Added("first")), 0);
        assert_eq!(registry.publish("/k", &WatchEvent::Modified("second")), 1);

        // Assert
        assert_eq!(registry.len(), 0, "evicted watcher is unregistered");
        assert_eq!(
            stream.next().await.map(Result::ok),
            Some(Some(WatchEvent::Added("first"))),
            "buffered events are still delivered"
        );
        let err = stream
            .next()
            .await
            .expect("terminal error")
            .expect_err("eviction is reported");
        assert_eq!(err.current_context(), &StorageError::WatcherEvicted);
        assert!(stream.next().await.is_none(), "nothing after the error");
    }

    #[tokio::test]
    async fn dropping_stream_unregisters() {
        let registry = registry(4);
        let stream = registry.register("/".to_string(), VecDeque::new());
        assert_eq!(registry.len(), 1);
        drop(stream);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn zero_revision_means_snapshot() {
        assert_eq!(WatchStart::from_revision(None), WatchStart::Snapshot);
        assert_eq!(WatchStart::from_revision(Some(0)), WatchStart::Snapshot);
        assert_eq!(WatchStart::from_revision(Some(7)), WatchStart::After(7));
    }
}
