use std::sync::Arc;
use std::time::Duration;

use api_types::descriptor;
use api_types::Gpu;
use api_types::ResourceDescriptor;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;

use crate::metrics::ServerMetrics;
use crate::service::GpuService;
use crate::storage::Backend;
use crate::storage::Store;

/// Shared dependencies handed to every provider at registration.
#[derive(Clone)]
pub struct ProviderContext {
    pub backend: Arc<dyn Backend>,
    pub node_name: String,
    pub metrics: ServerMetrics,
    pub progress_notify_interval: Option<Duration>,
    /// Cancelled when the server starts draining.
    pub shutdown: CancellationToken,
}

/// A resource service mounted on the API socket.
pub trait ServiceProvider: Send + Sync {
    fn descriptor(&self) -> ResourceDescriptor;

    /// Fully qualified gRPC service name, also used for health reporting.
    fn service_name(&self) -> &'static str {
        self.descriptor().service
    }

    fn register(&self, ctx: &ProviderContext, routes: &mut RoutesBuilder);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GpuServiceProvider;

impl ServiceProvider for GpuServiceProvider {
    fn descriptor(&self) -> ResourceDescriptor {
        descriptor::GPU
    }

    fn register(&self, ctx: &ProviderContext, routes: &mut RoutesBuilder) {
        let store = Store::<Gpu>::new(ctx.backend.clone(), &ctx.node_name)
            .with_eviction_counter(ctx.metrics.watch_events_dropped.clone());
        let service = GpuService::new(
            Arc::new(store),
            ctx.metrics.clone(),
            ctx.progress_notify_interval,
            ctx.shutdown.clone(),
        );
        routes.add_service(service.into_server());
    }
}

/// Every provider built into this binary.
pub fn default_providers() -> Vec<Box<dyn ServiceProvider>> {
    vec![Box::new(GpuServiceProvider)]
}
