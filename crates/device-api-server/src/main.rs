use anyhow::Result;
use clap::Parser;
use device_api_server::config::Args;
use device_api_server::config::ServerConfig;
use device_api_server::server::default_providers;
use device_api_server::server::DeviceApiServer;
use tokio_util::sync::CancellationToken;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();
    let args = Args::parse();
    utils::logging::init();

    tracing::info!("Starting device API server {}", &**version::VERSION);

    let config = ServerConfig::try_from(args)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e:?}"))?;
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    DeviceApiServer::new(config, default_providers())
        .run(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        shutdown.cancel();
    });
    Ok(())
}
