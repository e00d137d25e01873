//! One informer per resource kind, shared by every consumer of a factory.

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use api_types::Gpu;
use api_types::Resource;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::GpuClient;
use crate::informer::wait_synced;
use crate::informer::SharedIndexInformer;
use crate::lister::GpuLister;

/// Type-erased handle the factory uses to start and observe an informer.
trait InformerControl: Send + Sync {
    fn resource(&self) -> &'static str;

    fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()>;

    fn synced(&self) -> watch::Receiver<bool>;
}

impl<T: Resource> InformerControl for SharedIndexInformer<T> {
    fn resource(&self) -> &'static str {
        T::DESCRIPTOR.plural
    }

    fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    fn synced(&self) -> watch::Receiver<bool> {
        self.synced_receiver()
    }
}

struct Entry {
    control: Arc<dyn InformerControl>,
    typed: Arc<dyn Any + Send + Sync>,
    started: bool,
}

struct Inner {
    client: GpuClient,
    namespace: String,
    resync_period: Option<Duration>,
    informers: Mutex<HashMap<TypeId, Entry>>,
    running: Mutex<Vec<(CancellationToken, JoinHandle<()>)>>,
}

/// Builds informers lazily and starts each one exactly once.
#[derive(Clone)]
pub struct SharedInformerFactory {
    inner: Arc<Inner>,
}

impl SharedInformerFactory {
    /// Informers watch the whole node.
    pub fn new(client: GpuClient, resync_period: Option<Duration>) -> Self {
        Self::with_namespace(client, "", resync_period)
    }

    /// Informers are restricted to `namespace`.
    pub fn with_namespace(client: GpuClient, namespace: impl Into<String>, resync_period: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                namespace: namespace.into(),
                resync_period,
                informers: Mutex::new(HashMap::new()),
                running: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the informer for `T`, building it with `build` on first use.
    pub fn informer_for<T, F>(&self, build: F) -> Arc<SharedIndexInformer<T>>
    where
        T: Resource,
        F: FnOnce() -> SharedIndexInformer<T>,
    {
        let mut informers = self.inner.informers.lock().unwrap_or_else(PoisonError::into_inner);
        let type_id = TypeId::of::<T>();
        if let Some(existing) = informers
            .get(&type_id)
            .and_then(|entry| entry.typed.clone().downcast::<SharedIndexInformer<T>>().ok())
        {
            return existing;
        }
        let informer = Arc::new(build());
        informers.insert(
            type_id,
            Entry {
                control: informer.clone(),
                typed: informer.clone(),
                started: false,
            },
        );
        informer
    }

    pub fn gpus(&self) -> GpuInformer {
        let informer = self.informer_for(|| {
            SharedIndexInformer::new(
                Arc::new(self.inner.client.list_watcher(self.inner.namespace.clone())),
                self.inner.resync_period,
            )
        });
        GpuInformer { informer }
    }

    /// Starts every informer requested so far that is not running yet.
    /// They stop when `cancel` fires or on [`SharedInformerFactory::shutdown`].
    pub fn start(&self, cancel: &CancellationToken) {
        let mut informers = self.inner.informers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut running = self.inner.running.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in informers.values_mut().filter(|e| !e.started) {
            entry.started = true;
            let token = cancel.child_token();
            info!(resource = entry.control.resource(), "starting informer");
            running.push((token.clone(), entry.control.clone().spawn(token)));
        }
    }

    /// Waits for every started informer's first sync.
    ///
    /// Returns each resource's outcome; `false` means `cancel` fired first.
    pub async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> HashMap<&'static str, bool> {
        let pending: Vec<_> = {
            let informers = self.inner.informers.lock().unwrap_or_else(PoisonError::into_inner);
            informers
                .values()
                .filter(|e| e.started)
                .map(|e| (e.control.resource(), e.control.synced()))
                .collect()
        };
        let mut synced = HashMap::new();
        for (resource, receiver) in pending {
            synced.insert(resource, wait_synced(receiver, cancel).await);
        }
        synced
    }

    /// Stops every started informer and waits for them to finish.
    pub async fn shutdown(&self) {
        let running: Vec<_> = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (token, _) in &running {
            token.cancel();
        }
        for (_, task) in running {
            let _ = task.await;
        }
    }
}

/// Access to the shared GPU informer and its lister.
#[derive(Clone)]
pub struct GpuInformer {
    informer: Arc<SharedIndexInformer<Gpu>>,
}

impl GpuInformer {
    pub fn informer(&self) -> Arc<SharedIndexInformer<Gpu>> {
        self.informer.clone()
    }

    pub fn lister(&self) -> GpuLister {
        GpuLister::new(self.informer.indexer())
    }
}
