use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use api_proto::codec::gpu_from_wire;
use api_proto::event_type;
use api_proto::v1alpha1 as wire;
use api_proto::v1alpha1::gpu_service_server;
use api_types::validation::validate_gpu;
use api_types::ensure_name;
use api_types::Gpu;
use api_types::GpuList;
use api_types::ListMeta;
use api_types::Resource;
use error_stack::Report;
use prometheus::IntGauge;
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::status::storage_status;
use super::status::validation_status;
use crate::metrics::ServerMetrics;
use crate::storage::parse_revision;
use crate::storage::Revision;
use crate::storage::StorageError;
use crate::storage::Store;
use crate::storage::WatchEvent;
use crate::storage::WatchStart;
use crate::storage::WatchStream;

/// Responses buffered between a watch forwarder and the transport.
const WATCH_RESPONSE_BUFFER: usize = 64;

/// The `GpuService` RPC surface, backed by a [`Store`].
#[derive(Clone)]
pub struct GpuService {
    store: Arc<Store<Gpu>>,
    metrics: ServerMetrics,
    progress_notify_interval: Option<Duration>,
    shutdown: CancellationToken,
}

impl GpuService {
    pub fn new(
        store: Arc<Store<Gpu>>,
        metrics: ServerMetrics,
        progress_notify_interval: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            metrics,
            progress_notify_interval,
            shutdown,
        }
    }

    pub fn into_server(self) -> gpu_service_server::GpuServiceServer<Self> {
        gpu_service_server::GpuServiceServer::new(self)
    }

    async fn observed<T, F>(&self, method: &str, call: F) -> Result<Response<T>, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        let started = Instant::now();
        let result = call.await;
        let code = result.as_ref().map_or_else(Status::code, |_| tonic::Code::Ok);
        self.metrics.observe_request(method, code, started.elapsed());
        match &result {
            Ok(_) => debug!(method, "request served"),
            Err(status) => debug!(
                method,
                code = ?status.code(),
                error = status.message(),
                "request failed"
            ),
        }
        result.map(Response::new)
    }

    async fn get(&self, req: wire::GetGpuRequest) -> Result<wire::GetGpuResponse, Status> {
        require_name(&req.name)?;
        let hint = parse_revision(&req.resource_version).map_err(|e| storage_status(&e))?;
        let gpu = self
            .store
            .get(&req.namespace, &req.name, hint)
            .await
            .map_err(|e| storage_status(&e))?;
        Ok(wire::GetGpuResponse {
            gpu: Some(gpu.into()),
        })
    }

    async fn list(&self, req: wire::ListGpusRequest) -> Result<wire::ListGpusResponse, Status> {
        let hint = parse_revision(&req.resource_version).map_err(|e| storage_status(&e))?;
        let (items, revision) = self
            .store
            .list(scope(&req.namespace), hint)
            .await
            .map_err(|e| storage_status(&e))?;
        let list = GpuList {
            metadata: ListMeta {
                resource_version: revision.to_string(),
            },
            items,
        };
        Ok(wire::ListGpusResponse {
            gpu_list: Some(list.into()),
        })
    }

    async fn create(&self, req: wire::CreateGpuRequest) -> Result<wire::CreateGpuResponse, Status> {
        let mut gpu = gpu_from_wire(req.gpu).ok_or_else(|| Status::invalid_argument("gpu is required"))?;
        ensure_name(&mut gpu);
        validate_gpu(&gpu).map_err(|e| validation_status(&e))?;
        gpu.metadata.generation = 1;

        let created = self.store.create(gpu).await.map_err(|e| storage_status(&e))?;
        info!(
            name = %created.name(),
            namespace = %created.metadata.namespace,
            uuid = %created.spec.uuid,
            resource_version = %created.resource_version(),
            "gpu created"
        );
        Ok(wire::CreateGpuResponse {
            gpu: Some(created.into()),
        })
    }

    async fn update(&self, req: wire::UpdateGpuRequest) -> Result<wire::UpdateGpuResponse, Status> {
        let incoming = gpu_from_wire(req.gpu).ok_or_else(|| Status::invalid_argument("gpu is required"))?;
        require_name(&incoming.metadata.name)?;
        validate_gpu(&incoming).map_err(|e| validation_status(&e))?;
        // "0" carries no precondition, like an empty resource version.
        let expected = parse_revision(&incoming.metadata.resource_version)
            .map_err(|e| storage_status(&e))?
            .filter(|rev| *rev > 0);

        let namespace = incoming.metadata.namespace.clone();
        let name = incoming.metadata.name.clone();
        let updated = self
            .store
            .guaranteed_update(&namespace, &name, expected, move |current| {
                let merged = merge_update(&current, incoming);
                // Carried-over generateName must still agree with the new `spec`.
                validate_gpu(&merged).map_err(|e| {
                    Report::new(StorageError::InvalidObject {
                        message: e.to_string(),
                    })
                })?;
                Ok(merged)
            })
            .await
            .map_err(|e| storage_status(&e))?;
        debug!(
            %name,
            generation = updated.metadata.generation,
            resource_version = %updated.resource_version(),
            "gpu updated"
        );
        Ok(wire::UpdateGpuResponse {
            gpu: Some(updated.into()),
        })
    }

    async fn delete(&self, req: wire::DeleteGpuRequest) -> Result<wire::DeleteGpuResponse, Status> {
        require_name(&req.name)?;
        let deleted = self
            .store
            .delete(&req.namespace, &req.name)
            .await
            .map_err(|e| storage_status(&e))?;
        info!(
            name = %deleted.name(),
            namespace = %deleted.metadata.namespace,
            resource_version = %deleted.resource_version(),
            "gpu deleted"
        );
        Ok(wire::DeleteGpuResponse {})
    }

    async fn open_watch(
        &self,
        req: wire::WatchGpusRequest,
    ) -> Result<ReceiverStream<Result<wire::WatchGpusResponse, Status>>, Status> {
        let revision = parse_revision(&req.resource_version).map_err(|e| storage_status(&e))?;
        let start = WatchStart::from_revision(revision);
        let stream = self
            .store
            .watch(scope(&req.namespace), start)
            .await
            .map_err(|e| storage_status(&e))?;

        let (tx, rx) = mpsc::channel(WATCH_RESPONSE_BUFFER);
        let forwarder = WatchForwarder {
            store: self.store.clone(),
            stream,
            tx,
            progress_notify_interval: self.progress_notify_interval,
            shutdown: self.shutdown.clone(),
            open_streams: self
                .metrics
                .watch_streams
                .with_label_values(&[Gpu::DESCRIPTOR.plural]),
        };
        debug!(namespace = %req.namespace, ?start, "watch opened");
        tokio::spawn(forwarder.run());
        Ok(ReceiverStream::new(rx))
    }
}

#[tonic::async_trait]
impl gpu_service_server::GpuService for GpuService {
    async fn get_gpu(
        &self,
        request: Request<wire::GetGpuRequest>,
    ) -> Result<Response<wire::GetGpuResponse>, Status> {
        self.observed("GetGpu", self.get(request.into_inner())).await
    }

    async fn list_gpus(
        &self,
        request: Request<wire::ListGpusRequest>,
    ) -> Result<Response<wire::ListGpusResponse>, Status> {
        self.observed("ListGpus", self.list(request.into_inner())).await
    }

    type WatchGpusStream = ReceiverStream<Result<wire::WatchGpusResponse, Status>>;

    async fn watch_gpus(
        &self,
        request: Request<wire::WatchGpusRequest>,
    ) -> Result<Response<Self::WatchGpusStream>, Status> {
        self.observed("WatchGpus", self.open_watch(request.into_inner()))
            .await
    }

    async fn create_gpu(
        &self,
        request: Request<wire::CreateGpuRequest>,
    ) -> Result<Response<wire::CreateGpuResponse>, Status> {
        self.observed("CreateGpu", self.create(request.into_inner()))
            .await
    }

    async fn update_gpu(
        &self,
        request: Request<wire::UpdateGpuRequest>,
    ) -> Result<Response<wire::UpdateGpuResponse>, Status> {
        self.observed("UpdateGpu", self.update(request.into_inner()))
            .await
    }

    async fn delete_gpu(
        &self,
        request: Request<wire::DeleteGpuRequest>,
    ) -> Result<Response<wire::DeleteGpuResponse>, Status> {
        self.observed("DeleteGpu", self.delete(request.into_inner()))
            .await
    }
}

/// Empty namespace on list and watch means every namespace on the node.
fn scope(namespace: &str) -> Option<&str> {
    (!namespace.is_empty()).then_some(namespace)
}

fn require_name(name: &str) -> Result<(), Status> {
    if name.is_empty() {
        return Err(Status::invalid_argument("name is required"));
    }
    Ok(())
}

/// Applies a client update on top of the stored object.
///
/// Identity left empty by the client is carried over; the generation moves
/// only when `spec` changes.
fn merge_update(current: &Gpu, mut next: Gpu) -> Gpu {
    let meta = &mut next.metadata;
    if meta.namespace.is_empty() {
        meta.namespace = current.metadata.namespace.clone();
    }
    if meta.uid.is_empty() {
        meta.uid = current.metadata.uid.clone();
    }
    if meta.generate_name.is_empty() {
        meta.generate_name = current.metadata.generate_name.clone();
    }
    meta.generation = if next.spec == current.spec {
        current.metadata.generation
    } else {
        current.metadata.generation + 1
    };
    next
}

/// Pumps one store watch onto one RPC stream.
struct WatchForwarder {
    store: Arc<Store<Gpu>>,
    stream: WatchStream<Gpu>,
    tx: mpsc::Sender<Result<wire::WatchGpusResponse, Status>>,
    progress_notify_interval: Option<Duration>,
    shutdown: CancellationToken,
    open_streams: IntGauge,
}

impl WatchForwarder {
    async fn run(mut self) {
        self.open_streams.inc();
        let mut ticker = self.progress_notify_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("server shutting down, closing watch");
                    break;
                }
                _ = self.tx.closed() => {
                    debug!("watch client went away");
                    break;
                }
                _ = next_tick(&mut ticker) => {
                    if let Err(status) = self.send_bookmark().await {
                        debug!(code = ?status.code(), "bookmark not delivered");
                        break;
                    }
                }
                event = self.stream.next() => {
                    let Some(event) = event else { break };
                    let response = event
                        .map(watch_response)
                        .map_err(|e| {
                            warn!(error = %e.current_context(), "watch terminated");
                            storage_status(&e)
                        });
                    let terminal = response.is_err();
                    if self.tx.send(response).await.is_err() || terminal {
                        break;
                    }
                }
            }
        }
        self.open_streams.dec();
    }

    /// Sends a progress bookmark if every event up to the published revision
    /// has already been forwarded.
    async fn send_bookmark(&mut self) -> Result<(), Status> {
        if !self.stream.is_idle() {
            return Ok(());
        }
        let revision = match self.store.published_revision().await {
            Ok(revision) => revision,
            Err(e) => {
                warn!(error = ?e, "failed to read revision for bookmark");
                return Ok(());
            }
        };
        if !self.stream.is_idle() {
            return Ok(());
        }
        self.tx
            .send(Ok(bookmark(revision)))
            .await
            .map_err(|_| Status::cancelled("watch closed"))
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn watch_response(event: WatchEvent<Gpu>) -> wire::WatchGpusResponse {
    wire::WatchGpusResponse {
        r#type: event.type_name().to_string(),
        object: Some(event.into_object().into()),
        status: None,
    }
}

fn bookmark(revision: Revision) -> wire::WatchGpusResponse {
    wire::WatchGpusResponse {
        r#type: event_type::BOOKMARK.to_string(),
        object: Some(wire::Gpu {
            metadata: Some(wire::ObjectMeta {
                resource_version: revision.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}
