//! Server runtime: socket lifecycle, health, admin and metrics endpoints,
//! graceful shutdown.

mod provider;
pub mod socket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use core::error::Error;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use poem::get;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::Acceptor;
use poem::listener::Listener;
use poem::listener::TcpListener as PoemTcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use prometheus::Encoder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use provider::default_providers;
pub use provider::GpuServiceProvider;
pub use provider::ProviderContext;
pub use provider::ServiceProvider;

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::storage::open_backend;
use crate::storage::Compactor;

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[display("failed to prepare socket {path}")]
    Socket { path: String },

    #[display("socket {path} is in use by another server")]
    SocketInUse { path: String },

    #[display("failed to bind {address}")]
    Bind { address: String },

    #[display("storage initialisation failed")]
    Storage,

    #[display("metrics initialisation failed")]
    Metrics,

    #[display("reflection service initialisation failed")]
    Reflection,

    #[display("gRPC server terminated unexpectedly")]
    Serve,
}

impl Error for ServerError {}

/// Where the running server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddresses {
    pub socket: PathBuf,
    pub health_probe: SocketAddr,
    pub metrics: SocketAddr,
}

/// The device API server.
///
/// Health stays `NOT_SERVING` until storage is open and every provider is
/// mounted on the socket.
pub struct DeviceApiServer {
    config: ServerConfig,
    providers: Vec<Box<dyn ServiceProvider>>,
    ready: watch::Sender<Option<ListenAddresses>>,
}

impl DeviceApiServer {
    pub fn new(config: ServerConfig, providers: Vec<Box<dyn ServiceProvider>>) -> Self {
        let (ready, _) = watch::channel(None);
        Self {
            config,
            providers,
            ready,
        }
    }

    /// Holds the listen addresses while the server is serving, `None` otherwise.
    pub fn ready_signal(&self) -> watch::Receiver<Option<ListenAddresses>> {
        self.ready.subscribe()
    }

    /// Runs until `shutdown` is cancelled or the API endpoint fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Report<ServerError>> {
        let config = &self.config;
        let metrics = ServerMetrics::new().change_context(ServerError::Metrics)?;
        let (mut health, health_service) = tonic_health::server::health_reporter();
        self.set_health(&mut health, ServingStatus::NotServing).await;

        let drain = CancellationToken::new();
        // Stops whatever was already started if startup bails out early.
        let _drain_on_exit = drain.clone().drop_guard();
        let mut background = Vec::new();

        let health_probe = {
            let mut admin_routes = RoutesBuilder::default();
            admin_routes.add_service(health_service.clone());
            let (address, task) =
                spawn_admin_endpoint(config.health_probe_address, admin_routes, drain.clone()).await?;
            background.push(task);
            address
        };
        let metrics_address = {
            let (address, task) =
                spawn_metrics_endpoint(config.metrics_address, metrics.clone(), drain.clone()).await?;
            background.push(task);
            address
        };

        let backend = open_backend(&config.storage)
            .await
            .change_context(ServerError::Storage)?;
        if let Some(interval) = config.storage.compaction_interval {
            let compactor = Compactor::new(backend.clone(), interval, config.storage.compaction_batch_size)
                .with_gauges(metrics.storage_revision.clone(), metrics.compacted_revision.clone());
            background.push(tokio::spawn(compactor.run(drain.clone())));
        }

        let ctx = ProviderContext {
            backend,
            node_name: config.node_name.clone(),
            metrics: metrics.clone(),
            progress_notify_interval: config.progress_notify_interval,
            shutdown: drain.clone(),
        };
        let mut routes = RoutesBuilder::default();
        for provider in &self.providers {
            provider.register(&ctx, &mut routes);
            info!(service = provider.service_name(), "registered service");
        }
        routes.add_service(health_service);

        let listener = socket::bind(&config.socket_path).await?;
        let mut api = {
            let drain = drain.clone();
            tokio::spawn(
                tonic::transport::Server::builder()
                    .add_routes(routes.routes())
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                        drain.cancelled().await;
                        info!("draining API endpoint");
                    }),
            )
        };

        self.set_health(&mut health, ServingStatus::Serving).await;
        let addresses = ListenAddresses {
            socket: config.socket_path.clone(),
            health_probe,
            metrics: metrics_address,
        };
        info!(
            node = %config.node_name,
            socket = %addresses.socket.display(),
            health_probe = %addresses.health_probe,
            metrics = %addresses.metrics,
            "device API server is serving"
        );
        self.ready.send_replace(Some(addresses));

        let api_exit = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested");
                None
            }
            exit = &mut api => Some(exit),
        };

        self.ready.send_replace(None);
        self.set_health(&mut health, ServingStatus::NotServing).await;
        drain.cancel();

        let result = match api_exit {
            None => {
                wait_or_abort("API endpoint", api, config.shutdown_grace_period).await;
                Ok(())
            }
            Some(Ok(Ok(()))) => Err(Report::new(ServerError::Serve)),
            Some(Ok(Err(e))) => Err(Report::new(e).change_context(ServerError::Serve)),
            Some(Err(e)) => Err(Report::new(e).change_context(ServerError::Serve)),
        };
        for task in background {
            wait_or_abort("background task", task, config.shutdown_grace_period).await;
        }
        socket::remove(&config.socket_path);
        info!("device API server stopped");
        result
    }

    async fn set_health(&self, health: &mut HealthReporter, status: ServingStatus) {
        health.set_service_status("", status).await;
        for provider in &self.providers {
            health
                .set_service_status(provider.service_name(), status)
                .await;
        }
    }
}

async fn wait_or_abort<T>(name: &str, mut task: JoinHandle<T>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        warn!(task = name, ?grace, "grace period elapsed, forcing stop");
        task.abort();
    }
}

/// Health and reflection over TCP, for probes and debugging tools.
async fn spawn_admin_endpoint(
    address: SocketAddr,
    mut routes: RoutesBuilder,
    drain: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), Report<ServerError>> {
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(api_proto::FILE_DESCRIPTOR_SET)
        .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
        .build_v1()
        .change_context(ServerError::Reflection)?;
    routes.add_service(reflection);

    let bind_error = || ServerError::Bind {
        address: address.to_string(),
    };
    let listener = TcpListener::bind(address)
        .await
        .change_context_lazy(bind_error)?;
    let local = listener.local_addr().change_context_lazy(bind_error)?;
    info!(address = %local, "admin endpoint listening");

    let task = tokio::spawn(async move {
        let served = tonic::transport::Server::builder()
            .add_routes(routes.routes())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                drain.cancelled().await;
            })
            .await;
        if let Err(e) = served {
            error!(error = %e, "admin endpoint failed");
        }
    });
    Ok((local, task))
}

#[handler]
fn render_metrics(Data(metrics): Data<&ServerMetrics>) -> poem::Result<Response> {
    let body = metrics.render().map_err(|e| {
        error!(error = ?e, "failed to render metrics");
        poem::Error::from_string(e.current_context().to_string(), StatusCode::INTERNAL_SERVER_ERROR)
    })?;
    Ok(Response::builder()
        .content_type(prometheus::TextEncoder::new().format_type())
        .body(body))
}

/// Prometheus exposition on `GET /metrics`.
async fn spawn_metrics_endpoint(
    address: SocketAddr,
    metrics: ServerMetrics,
    drain: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), Report<ServerError>> {
    let bind_error = || ServerError::Bind {
        address: address.to_string(),
    };
    let acceptor = PoemTcpListener::bind(address)
        .into_acceptor()
        .await
        .change_context_lazy(bind_error)?;
    let local = acceptor
        .local_addr()
        .first()
        .and_then(|addr| addr.as_socket_addr().copied())
        .ok_or_else(|| Report::new(bind_error()))?;
    info!(address = %local, "metrics endpoint listening");

    let app = Route::new()
        .at("/metrics", get(render_metrics))
        .data(metrics)
        .with(Tracing);
    let task = tokio::spawn(async move {
        let served = poem::Server::new_with_acceptor(acceptor)
            .run_with_graceful_shutdown(
                app,
                async move { drain.cancelled().await },
                Some(Duration::from_secs(1)),
            )
            .await;
        if let Err(e) = served {
            error!(error = %e, "metrics endpoint failed");
        }
    });
    Ok((local, task))
}
