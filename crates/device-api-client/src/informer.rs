//! Shared informer: a reflector-fed cache plus fan-out to event handlers.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use api_types::Resource;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::indexer::namespace_index_func;
use crate::indexer::Delta;
use crate::indexer::Indexer;
use crate::indexer::Indexers;
use crate::indexer::NAMESPACE_INDEX;
use crate::reflector::ListerWatcher;
use crate::reflector::Reflector;
use crate::watch::WatchEvent;

/// Callbacks for cache changes. Every method defaults to doing nothing.
///
/// Calls for one handler are made in order from a single task, after the
/// cache already reflects the change. Objects are shared with the cache and
/// must not be mutated.
pub trait ResourceEventHandler<T>: Send + Sync + 'static {
    /// `is_initial_list` is set for objects delivered before the first sync
    /// and for the replay a handler receives when it is registered.
    fn on_add(&self, _obj: &T, _is_initial_list: bool) {}

    fn on_update(&self, _old: &T, _new: &T) {}

    fn on_delete(&self, _obj: &T) {}
}

#[derive(Debug)]
enum Notification<T> {
    Add { obj: Arc<T>, is_initial_list: bool },
    Update { old: Arc<T>, new: Arc<T> },
    Delete(Arc<T>),
}

impl<T> Clone for Notification<T> {
    fn clone(&self) -> Self {
        match self {
            Notification::Add { obj, is_initial_list } => Notification::Add {
                obj: obj.clone(),
                is_initial_list: *is_initial_list,
            },
            Notification::Update { old, new } => Notification::Update {
                old: old.clone(),
                new: new.clone(),
            },
            Notification::Delete(obj) => Notification::Delete(obj.clone()),
        }
    }
}

/// Cache plus registered listeners, shared between the informer and its
/// reflector.
pub(crate) struct InformerState<T> {
    indexer: Arc<Indexer<T>>,
    /// Held for reading while a change is applied to the cache and queued,
    /// so a listener registering concurrently sees each change exactly once.
    listeners: RwLock<Vec<mpsc::UnboundedSender<Notification<T>>>>,
    synced: watch::Sender<bool>,
    resource_version: Mutex<String>,
}

impl<T: Resource> InformerState<T> {
    fn new(indexer: Arc<Indexer<T>>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            indexer,
            listeners: RwLock::new(Vec::new()),
            synced,
            resource_version: Mutex::new(String::new()),
        }
    }

    fn distribute(listeners: &[mpsc::UnboundedSender<Notification<T>>], notification: Notification<T>) {
        for listener in listeners {
            // A closed listener has been shut down.
            let _ = listener.send(notification.clone());
        }
    }

    pub(crate) fn set_resource_version(&self, resource_version: &str) {
        *self.resource_version.lock().unwrap_or_else(PoisonError::into_inner) = resource_version.to_string();
    }

    /// Installs a fresh list snapshot and marks the cache synced.
    pub(crate) fn replace(&self, items: Vec<T>, resource_version: &str) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let is_initial_list = !*self.synced.borrow();
        for delta in self.indexer.replace(items) {
            let notification = match delta {
                Delta::Added(obj) => Notification::Add { obj, is_initial_list },
                Delta::Updated { old, new } => Notification::Update { old, new },
                Delta::Deleted(obj) => Notification::Delete(obj),
            };
            Self::distribute(&listeners, notification);
        }
        self.set_resource_version(resource_version);
        self.synced.send_replace(true);
    }

    /// Applies one watch event; returns its resource version.
    pub(crate) fn apply(&self, event: WatchEvent<T>) -> Option<String> {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let (resource_version, notification) = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let obj = Arc::new(obj);
                let resource_version = obj.resource_version().to_string();
                let old = self.indexer.add(T::clone(&obj));
                let notification = match old {
                    Some(old) => Notification::Update { old, new: obj },
                    None => Notification::Add {
                        obj,
                        is_initial_list: false,
                    },
                };
                (resource_version, notification)
            }
            WatchEvent::Deleted(obj) => {
                let resource_version = obj.resource_version().to_string();
                self.indexer.delete(&obj.key());
                (resource_version, Notification::Delete(Arc::new(obj)))
            }
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => return None,
        };
        self.set_resource_version(&resource_version);
        Self::distribute(&listeners, notification);
        Some(resource_version)
    }

    /// Replays every cached object as an update to itself.
    pub(crate) fn resync(&self) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for obj in self.indexer.list() {
            Self::distribute(
                &listeners,
                Notification::Update {
                    old: obj.clone(),
                    new: obj,
                },
            );
        }
    }

    fn add_listener(&self, handler: Arc<dyn ResourceEventHandler<T>>) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let (tx, rx) = mpsc::unbounded_channel();
        for obj in self.indexer.list() {
            let _ = tx.send(Notification::Add {
                obj,
                is_initial_list: true,
            });
        }
        tokio::spawn(run_listener(handler, rx));
        listeners.push(tx);
    }

    /// Closes every listener once its queue is drained.
    fn shutdown(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Waits until `synced` turns true; false if `cancel` fired first.
pub(crate) async fn wait_synced(mut synced: watch::Receiver<bool>, cancel: &CancellationToken) -> bool {
    loop {
        if *synced.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = synced.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn run_listener<T: 'static>(
    handler: Arc<dyn ResourceEventHandler<T>>,
    mut notifications: mpsc::UnboundedReceiver<Notification<T>>,
) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::Add { obj, is_initial_list } => handler.on_add(&obj, is_initial_list),
            Notification::Update { old, new } => handler.on_update(&old, &new),
            Notification::Delete(obj) => handler.on_delete(&obj),
        }
    }
}

/// Keeps a cache of one resource kind in sync and notifies handlers.
pub struct SharedIndexInformer<T: Resource> {
    state: Arc<InformerState<T>>,
    lister_watcher: Arc<dyn ListerWatcher<T>>,
    resync_period: Option<Duration>,
    started: AtomicBool,
}

impl<T: Resource> SharedIndexInformer<T> {
    /// `resync_period` of `None` disables periodic resync.
    pub fn new(lister_watcher: Arc<dyn ListerWatcher<T>>, resync_period: Option<Duration>) -> Self {
        let indexer = Indexer::new(Indexers::from([(
            NAMESPACE_INDEX.to_string(),
            namespace_index_func::<T>(),
        )]));
        Self {
            state: Arc::new(InformerState::new(Arc::new(indexer))),
            lister_watcher,
            resync_period,
            started: AtomicBool::new(false),
        }
    }

    /// Registers `handler`. Objects already cached are replayed to it as
    /// initial adds. Must be called from within a Tokio runtime.
    pub fn add_event_handler(&self, handler: impl ResourceEventHandler<T>) {
        self.state.add_listener(Arc::new(handler));
    }

    pub fn add_indexers(&self, indexers: Indexers<T>) {
        self.state.indexer.add_indexers(indexers);
    }

    pub fn indexer(&self) -> Arc<Indexer<T>> {
        self.state.indexer.clone()
    }

    /// Whether the first list has been installed.
    pub fn has_synced(&self) -> bool {
        *self.state.synced.borrow()
    }

    /// Waits for the first sync; false if `cancel` fired first.
    pub async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        wait_synced(self.state.synced.subscribe(), cancel).await
    }

    /// Resource version of the last list or event applied.
    pub fn last_sync_resource_version(&self) -> String {
        self.state
            .resource_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn synced_receiver(&self) -> watch::Receiver<bool> {
        self.state.synced.subscribe()
    }

    /// Runs the list-then-watch loop until `cancel` fires, then closes the
    /// handlers. Only the first call does anything.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(resource = T::DESCRIPTOR.plural, "informer already started");
            return;
        }
        Reflector::new(self.lister_watcher.clone(), self.state.clone(), self.resync_period)
            .run(cancel)
            .await;
        self.state.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use api_types::Gpu;
    use api_types::ObjectMeta;
    use similar_asserts::assert_eq;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_stream::wrappers::ReceiverStream;
    use tonic::Status;

    use super::*;
    use crate::error::ClientResult;
    use crate::watch::RawWatchEvent;
    use crate::watch::Watcher;

    fn gpu(name: &str, rv: u64) -> Gpu {
        Gpu {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                resource_version: rv.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    type Feed = mpsc::Sender<Result<RawWatchEvent<Gpu>, Status>>;

    /// Serves scripted lists and hands out watches fed by the test.
    struct FakeSource {
        lists: Mutex<VecDeque<(Vec<Gpu>, String)>>,
        watches: mpsc::UnboundedSender<(String, Feed)>,
    }

    #[async_trait::async_trait]
    impl ListerWatcher<Gpu> for FakeSource {
        async fn list(&self) -> ClientResult<(Vec<Gpu>, String)> {
            let next = self.lists.lock().expect("lock").pop_front();
            Ok(next.unwrap_or_else(|| (Vec::new(), "0".to_string())))
        }

        async fn watch(&self, resource_version: &str) -> Watcher<Gpu> {
            let (tx, rx) = mpsc::channel(16);
            let _ = self.watches.send((resource_version.to_string(), tx));
            Watcher::spawn(ReceiverStream::new(rx))
        }
    }

    fn source(lists: Vec<(Vec<Gpu>, &str)>) -> (Arc<FakeSource>, UnboundedReceiver<(String, Feed)>) {
        let (watches, opened) = mpsc::unbounded_channel();
        let source = FakeSource {
            lists: Mutex::new(
                lists
                    .into_iter()
                    .map(|(items, rv)| (items, rv.to_string()))
                    .collect(),
            ),
            watches,
        };
        (Arc::new(source), opened)
    }

    fn event(type_: &str, obj: Gpu) -> Result<RawWatchEvent<Gpu>, Status> {
        Ok(RawWatchEvent {
            type_: type_.to_string(),
            resource_version: obj.metadata.resource_version.clone(),
            object: Some(obj),
            status: None,
        })
    }

    /// Records notifications as strings.
    struct Recorder(mpsc::UnboundedSender<String>);

    impl ResourceEventHandler<Gpu> for Recorder {
        fn on_add(&self, obj: &Gpu, is_initial_list: bool) {
            let _ = self.0.send(format!(
                "add {}@{} initial={is_initial_list}",
                obj.metadata.name, obj.metadata.resource_version
            ));
        }

        fn on_update(&self, old: &Gpu, new: &Gpu) {
            let _ = self.0.send(format!(
                "update {}@{}->{}",
                new.metadata.name, old.metadata.resource_version, new.metadata.resource_version
            ));
        }

        fn on_delete(&self, obj: &Gpu) {
            let _ = self.0.send(format!("delete {}", obj.metadata.name));
        }
    }

    async fn next(rx: &mut UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("notification in time")
            .expect("handler alive")
    }

    #[test_log::test(tokio::test)]
    async fn lists_then_applies_watch_events() {
        // Arrange
        let (source, mut opened) = source(vec![(vec![gpu("gpu-1", 7)], "7")]);
        let informer = Arc::new(SharedIndexInformer::new(source, None));
        let (tx, mut seen) = mpsc::unbounded_channel();
        informer.add_event_handler(Recorder(tx));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let informer = informer.clone();
            let cancel = cancel.clone();
            async move { informer.run(cancel).await }
        });

        // Act
        assert!(informer.wait_for_cache_sync(&cancel).await);
        let (from, feed) = opened.recv().await.expect("watch opened");
        feed.send(event("MODIFIED", gpu("gpu-1", 8))).await.expect("send");
        feed.send(event("ADDED", gpu("gpu-2", 9))).await.expect("send");
        feed.send(event("DELETED", gpu("gpu-1", 10))).await.expect("send");

        // Assert
        assert_eq!(from, "7");
        assert_eq!(next(&mut seen).await, "add gpu-1@7 initial=true");
        assert_eq!(next(&mut seen).await, "update gpu-1@7->8");
        assert_eq!(next(&mut seen).await, "add gpu-2@9 initial=false");
        assert_eq!(next(&mut seen).await, "delete gpu-1");
        assert_eq!(informer.indexer().list_keys(), vec!["default/gpu-2"]);
        assert_eq!(informer.last_sync_resource_version(), "10");

        cancel.cancel();
        task.await.expect("informer task");
        assert_eq!(seen.recv().await, None);
    }

    #[test_log::test(tokio::test)]
    async fn expired_watch_triggers_relist() {
        let (source, mut opened) = source(vec![
            (vec![gpu("gpu-1", 1)], "1"),
            (vec![gpu("gpu-1", 12), gpu("gpu-3", 11)], "12"),
        ]);
        let informer = Arc::new(SharedIndexInformer::new(source, None));
        let (tx, mut seen) = mpsc::unbounded_channel();
        informer.add_event_handler(Recorder(tx));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let informer = informer.clone();
            let cancel = cancel.clone();
            async move { informer.run(cancel).await }
        });

        let (first_from, feed) = opened.recv().await.expect("first watch");
        feed.send(Err(Status::out_of_range("compacted")))
            .await
            .expect("send");
        let (second_from, feed) = opened.recv().await.expect("second watch");
        feed.send(event("ADDED", gpu("gpu-4", 13))).await.expect("send");

        assert_eq!(first_from, "1");
        assert_eq!(second_from, "12");
        assert_eq!(next(&mut seen).await, "add gpu-1@1 initial=true");
        assert_eq!(next(&mut seen).await, "update gpu-1@1->12");
        assert_eq!(next(&mut seen).await, "add gpu-3@11 initial=false");
        assert_eq!(next(&mut seen).await, "add gpu-4@13 initial=false");
        cancel.cancel();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn failed_watch_reopens_from_last_revision() {
        let (source, mut opened) = source(vec![(vec![], "5")]);
        let informer = Arc::new(SharedIndexInformer::new(source, None));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let informer = informer.clone();
            let cancel = cancel.clone();
            async move { informer.run(cancel).await }
        });

        let (_, feed) = opened.recv().await.expect("first watch");
        feed.send(event("ADDED", gpu("gpu-1", 6))).await.expect("send");
        feed.send(Ok(RawWatchEvent {
            type_: "BOOKMARK".to_string(),
            object: None,
            resource_version: "9".to_string(),
            status: None,
        }))
        .await
        .expect("send");
        feed.send(Err(Status::unavailable("connection reset")))
            .await
            .expect("send");
        let (from, _feed) = opened.recv().await.expect("reopened watch");

        assert_eq!(from, "9");
        assert_eq!(informer.indexer().list_keys(), vec!["default/gpu-1"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn late_handler_gets_cache_replay() {
        let (source, _opened) = source(vec![(vec![gpu("gpu-1", 3), gpu("gpu-2", 4)], "4")]);
        let informer = Arc::new(SharedIndexInformer::new(source, None));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let informer = informer.clone();
            let cancel = cancel.clone();
            async move { informer.run(cancel).await }
        });
        assert!(informer.wait_for_cache_sync(&cancel).await);

        let (tx, mut seen) = mpsc::unbounded_channel();
        informer.add_event_handler(Recorder(tx));

        assert_eq!(next(&mut seen).await, "add gpu-1@3 initial=true");
        assert_eq!(next(&mut seen).await, "add gpu-2@4 initial=true");
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn resync_replays_cache_as_updates() {
        let (source, _opened) = source(vec![(vec![gpu("gpu-1", 3)], "3")]);
        let informer = Arc::new(SharedIndexInformer::new(source, Some(Duration::from_secs(1))));
        let (tx, mut seen) = mpsc::unbounded_channel();
        informer.add_event_handler(Recorder(tx));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let informer = informer.clone();
            let cancel = cancel.clone();
            async move { informer.run(cancel).await }
        });

        assert_eq!(next(&mut seen).await, "add gpu-1@3 initial=true");
        assert_eq!(next(&mut seen).await, "update gpu-1@3->3");
        cancel.cancel();
    }

    #[tokio::test]
    async fn second_run_is_ignored() {
        let (source, _opened) = source(vec![]);
        let informer = SharedIndexInformer::<Gpu>::new(source, None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        informer.run(cancel.clone()).await;
        informer.run(cancel).await;

        assert!(!informer.has_synced());
    }
}
