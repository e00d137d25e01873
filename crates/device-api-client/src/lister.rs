use std::sync::Arc;

use api_types::meta::object_key;
use api_types::Gpu;
use api_types::LabelSelector;
use api_types::Resource;
use api_types::DEFAULT_NAMESPACE;
use error_stack::Report;

use crate::error::ClientError;
use crate::error::ClientResult;
use crate::indexer::IndexFunc;
use crate::indexer::Indexer;
use crate::indexer::Indexers;
use crate::indexer::NAMESPACE_INDEX;

/// Index of GPUs by the node they are attached to.
pub const NODE_NAME_INDEX: &str = "spec.nodeName";

/// Indexers for [`NODE_NAME_INDEX`], to pass to `add_indexers`.
pub fn node_name_indexers() -> Indexers<Gpu> {
    let by_node: IndexFunc<Gpu> = Arc::new(|gpu: &Gpu| vec![gpu.spec.node_name.clone()]);
    Indexers::from([(NODE_NAME_INDEX.to_string(), by_node)])
}

/// Read-only view of an informer's GPU cache.
#[derive(Clone)]
pub struct GpuLister {
    indexer: Arc<Indexer<Gpu>>,
}

impl GpuLister {
    pub fn new(indexer: Arc<Indexer<Gpu>>) -> Self {
        Self { indexer }
    }

    /// Every cached GPU whose labels match `selector`.
    pub fn list(&self, selector: &LabelSelector) -> Vec<Arc<Gpu>> {
        select(self.indexer.list(), selector)
    }

    /// Looks `name` up in the default namespace.
    pub fn get(&self, name: &str) -> ClientResult<Arc<Gpu>> {
        self.gpus(DEFAULT_NAMESPACE).get(name)
    }

    /// GPUs attached to `node`. Needs [`node_name_indexers`] installed.
    pub fn list_by_node(&self, node: &str) -> ClientResult<Vec<Arc<Gpu>>> {
        self.indexer.by_index(NODE_NAME_INDEX, node)
    }

    pub fn gpus(&self, namespace: &str) -> GpuNamespaceLister {
        GpuNamespaceLister {
            indexer: self.indexer.clone(),
            namespace: namespace.to_string(),
        }
    }
}

/// A [`GpuLister`] restricted to one namespace.
#[derive(Clone)]
pub struct GpuNamespaceLister {
    indexer: Arc<Indexer<Gpu>>,
    namespace: String,
}

impl GpuNamespaceLister {
    pub fn list(&self, selector: &LabelSelector) -> Vec<Arc<Gpu>> {
        let namespace = if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        };
        let items = match self.indexer.by_index(NAMESPACE_INDEX, namespace) {
            Ok(items) => items,
            Err(_) => self
                .indexer
                .list()
                .into_iter()
                .filter(|gpu| gpu.meta().namespace_or_default() == namespace)
                .collect(),
        };
        select(items, selector)
    }

    pub fn get(&self, name: &str) -> ClientResult<Arc<Gpu>> {
        self.indexer
            .get_by_key(&object_key(&self.namespace, name))
            .ok_or_else(|| {
                Report::new(ClientError::NotFound {
                    resource: Gpu::DESCRIPTOR.plural,
                    name: name.to_string(),
                })
            })
    }
}

fn select(items: Vec<Arc<Gpu>>, selector: &LabelSelector) -> Vec<Arc<Gpu>> {
    if selector.is_empty() {
        return items;
    }
    items
        .into_iter()
        .filter(|gpu| selector.matches(&gpu.metadata.labels))
        .collect()
}
