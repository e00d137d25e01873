use std::future::Future;
use std::time::Duration;

use api_proto::v1alpha1 as wire;
use api_proto::v1alpha1::gpu_service_client::GpuServiceClient;
use api_types::Gpu;
use api_types::GpuList;
use error_stack::Report;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;

use crate::error::ClientError;
use crate::error::ClientResult;
use crate::reflector::ListerWatcher;
use crate::transport;
use crate::transport::DialOptions;
use crate::transport::Transport;
use crate::watch::StatusError;
use crate::watch::Watcher;

/// Applied to unary calls; watches run until stopped.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed client for the GPU resource.
///
/// Cheap to clone; clones share the underlying connection.
#[derive(Clone)]
pub struct GpuClient {
    inner: GpuServiceClient<Transport>,
    timeout: Duration,
}

impl GpuClient {
    pub fn new(transport: Transport) -> Self {
        Self {
            inner: GpuServiceClient::new(transport),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub async fn connect(options: &DialOptions) -> ClientResult<Self> {
        Ok(Self::new(transport::connect(options).await?))
    }

    /// Like [`GpuClient::connect`].
    ///
    /// # Panics
    ///
    /// If the connection cannot be established.
    pub async fn connect_or_die(options: &DialOptions) -> Self {
        match Self::connect(options).await {
            Ok(client) => client,
            Err(e) => panic!("failed to connect to device API: {e:?}"),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn unary<M, T, F, Fut>(&self, method: &'static str, message: M, call: F) -> ClientResult<T>
    where
        F: FnOnce(GpuServiceClient<Transport>, Request<M>) -> Fut,
        Fut: Future<Output = Result<Response<T>, Status>>,
    {
        let mut request = Request::new(message);
        request.set_timeout(self.timeout);
        let response = tokio::time::timeout(self.timeout, call(self.inner.clone(), request))
            .await
            .map_err(|_| Report::new(ClientError::Timeout(self.timeout)))?
            .map_err(|status| {
                Report::new(ClientError::from_status(&status)).attach_printable(format!("{method} failed"))
            })?;
        Ok(response.into_inner())
    }

    pub async fn get(&self, namespace: &str, name: &str) -> ClientResult<Gpu> {
        let request = wire::GetGpuRequest {
            name: name.to_string(),
            namespace: namespace.to_string(),
            resource_version: String::new(),
        };
        let response = self
            .unary("GetGpu", request, |mut c, r| async move { c.get_gpu(r).await })
            .await?;
        response.gpu.map(Gpu::from).ok_or_else(|| missing_object("GetGpu"))
    }

    /// Lists GPUs in `namespace`, or on the whole node when it is empty.
    ///
    /// The list's resource version is the point to resume a watch from.
    pub async fn list(&self, namespace: &str) -> ClientResult<GpuList> {
        let request = wire::ListGpusRequest {
            namespace: namespace.to_string(),
            resource_version: String::new(),
        };
        let response = self
            .unary("ListGpus", request, |mut c, r| async move { c.list_gpus(r).await })
            .await?;
        Ok(response.gpu_list.map(GpuList::from).unwrap_or_default())
    }

    /// Opens a watch after `resource_version`; `""` or `"0"` starts with a
    /// snapshot of every existing GPU.
    ///
    /// A failure to open the stream is reported as the watcher's single
    /// error event.
    pub async fn watch(&self, namespace: &str, resource_version: &str) -> Watcher<Gpu> {
        let request = wire::WatchGpusRequest {
            namespace: namespace.to_string(),
            resource_version: resource_version.to_string(),
        };
        let mut client = self.inner.clone();
        match client.watch_gpus(request).await {
            Ok(response) => Watcher::spawn(response.into_inner()),
            Err(status) => {
                debug!(code = ?status.code(), "watch could not be opened");
                match StatusError::from_status(&status) {
                    Some(error) => Watcher::failed(error),
                    None => Watcher::closed(),
                }
            }
        }
    }

    /// Creates a GPU. An empty name is derived from `generateName`.
    pub async fn create(&self, gpu: Gpu) -> ClientResult<Gpu> {
        let request = wire::CreateGpuRequest {
            gpu: Some(gpu.into()),
        };
        let response = self
            .unary("CreateGpu", request, |mut c, r| async move { c.create_gpu(r).await })
            .await?;
        response.gpu.map(Gpu::from).ok_or_else(|| missing_object("CreateGpu"))
    }

    /// Replaces a GPU. A non-empty resource version makes the write
    /// conditional; a stale one fails with `ABORTED`.
    pub async fn update(&self, gpu: Gpu) -> ClientResult<Gpu> {
        let request = wire::UpdateGpuRequest {
            gpu: Some(gpu.into()),
        };
        let response = self
            .unary("UpdateGpu", request, |mut c, r| async move { c.update_gpu(r).await })
            .await?;
        response.gpu.map(Gpu::from).ok_or_else(|| missing_object("UpdateGpu"))
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> ClientResult<()> {
        let request = wire::DeleteGpuRequest {
            name: name.to_string(),
            namespace: namespace.to_string(),
        };
        self.unary("DeleteGpu", request, |mut c, r| async move { c.delete_gpu(r).await })
            .await?;
        Ok(())
    }

    /// List and watch source for an informer scoped to `namespace`.
    pub fn list_watcher(&self, namespace: impl Into<String>) -> GpuListWatch {
        GpuListWatch {
            client: self.clone(),
            namespace: namespace.into(),
        }
    }
}

fn missing_object(method: &str) -> Report<ClientError> {
    Report::new(ClientError::Status {
        code: tonic::Code::Internal,
        message: format!("{method} response carried no object"),
    })
}

/// [`ListerWatcher`] over a [`GpuClient`].
#[derive(Clone)]
pub struct GpuListWatch {
    client: GpuClient,
    namespace: String,
}

#[async_trait::async_trait]
impl ListerWatcher<Gpu> for GpuListWatch {
    async fn list(&self) -> ClientResult<(Vec<Gpu>, String)> {
        let list = self.client.list(&self.namespace).await?;
        Ok((list.items, list.metadata.resource_version))
    }

    async fn watch(&self, resource_version: &str) -> Watcher<Gpu> {
        self.client.watch(&self.namespace, resource_version).await
    }
}
