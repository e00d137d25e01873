//! Connection setup for the device API.
//!
//! The server listens on a Unix socket by default; plain `http://host:port`
//! targets are accepted for debugging against a TCP listener.

use std::path::PathBuf;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;
use std::time::Instant;

use error_stack::Report;
use error_stack::ResultExt;
use futures::future::BoxFuture;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Code;
use tower::service_fn;
use tower::Service;
use tracing::debug;
use tracing::warn;

use crate::error::ClientError;
use crate::error::ClientResult;
use crate::token::PerRpcCredentials;
use crate::token::TokenSource;

/// Environment variable overriding the dial target.
pub const TARGET_ENV: &str = "NVIDIA_DEVICE_API_TARGET";

pub const DEFAULT_TARGET: &str = "unix:///var/run/nvidia-device-api/device-api.sock";

/// The channel stack every client call goes through.
pub type Transport = InterceptedService<LatencyLogging<Channel>, PerRpcCredentials>;

/// How a [`crate::GpuClient`] dials the server.
///
/// There is no idle timeout: an idle connection stays open, kept alive by
/// HTTP/2 pings, until the client is dropped. tonic exposes no knob for
/// closing idle channels.
#[derive(Clone)]
pub struct DialOptions {
    pub target: String,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    /// Send keepalive pings even when no stream is open.
    pub keepalive_while_idle: bool,
    pub connect_timeout: Option<Duration>,
    pub user_agent: String,
    pub token_source: Option<Arc<dyn TokenSource>>,
}

impl std::fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialOptions")
            .field("target", &self.target)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("keepalive_while_idle", &self.keepalive_while_idle)
            .field("connect_timeout", &self.connect_timeout)
            .field("user_agent", &self.user_agent)
            .field("token_source", &self.token_source.is_some())
            .finish()
    }
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            keepalive_interval: Duration::from_secs(5 * 60),
            keepalive_timeout: Duration::from_secs(20),
            keepalive_while_idle: true,
            connect_timeout: None,
            user_agent: format!("device-api-client/{}", env!("CARGO_PKG_VERSION")),
            token_source: None,
        }
    }
}

impl DialOptions {
    /// Defaults, with the target taken from [`TARGET_ENV`] when set.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(target) = std::env::var(TARGET_ENV).ok().filter(|t| !t.is_empty()) {
            options.target = target;
        }
        options
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Dials the given socket path.
    pub fn with_socket(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.with_target(format!("unix://{}", path.display()))
    }

    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn endpoint(&self, uri: &str) -> ClientResult<Endpoint> {
        let config_error = || ClientError::Configuration {
            message: format!("invalid target {:?}", self.target),
        };
        let mut endpoint = Endpoint::from_shared(uri.to_string())
            .change_context_lazy(config_error)?
            .http2_keep_alive_interval(self.keepalive_interval)
            .keep_alive_timeout(self.keepalive_timeout)
            .keep_alive_while_idle(self.keepalive_while_idle)
            .user_agent(self.user_agent.clone())
            .change_context_lazy(|| ClientError::Configuration {
                message: format!("invalid user agent {:?}", self.user_agent),
            })?;
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        Ok(endpoint)
    }
}

/// Where a target string points.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Unix(PathBuf),
    Http(String),
}

fn parse_target(target: &str) -> ClientResult<Target> {
    if let Some(path) = target.strip_prefix("unix://") {
        if !path.starts_with('/') {
            return Err(Report::new(ClientError::Configuration {
                message: format!("unix target {target:?} must use an absolute path"),
            }));
        }
        return Ok(Target::Unix(PathBuf::from(path)));
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(Target::Http(target.to_string()));
    }
    if target.is_empty() {
        return Err(Report::new(ClientError::Configuration {
            message: "empty target".to_string(),
        }));
    }
    Ok(Target::Http(format!("http://{target}")))
}

/// Opens a channel to `options.target` with keepalive, latency logging and
/// per-RPC credentials applied.
pub async fn connect(options: &DialOptions) -> ClientResult<Transport> {
    let connect_error = || ClientError::Connect {
        target: options.target.clone(),
    };
    let channel = match parse_target(&options.target)? {
        Target::Unix(path) => {
            // The authority is ignored; the connector always dials `path`.
            options
                .endpoint("http://localhost")?
                .connect_with_connector(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
                }))
                .await
                .change_context_lazy(connect_error)?
        }
        Target::Http(uri) => options
            .endpoint(&uri)?
            .connect()
            .await
            .change_context_lazy(connect_error)?,
    };
    debug!(target = %options.target, "connected to device API");
    Ok(InterceptedService::new(
        LatencyLogging::new(channel),
        PerRpcCredentials::new(options.token_source.clone()),
    ))
}

/// Logs method, status code and latency of every call.
///
/// Latency is measured until response headers arrive; for watches that is
/// the time to open the stream.
#[derive(Debug, Clone)]
pub struct LatencyLogging<S> {
    inner: S,
}

impl<S> LatencyLogging<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for LatencyLogging<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        let method = request.uri().path().to_string();
        let started = Instant::now();
        let call = self.inner.call(request);
        Box::pin(async move {
            let result = call.await;
            let elapsed = started.elapsed();
            match &result {
                Ok(response) => {
                    // Successful unary calls carry their status in trailers.
                    let code = response
                        .headers()
                        .get("grpc-status")
                        .map_or(Code::Ok, |v| Code::from_bytes(v.as_bytes()));
                    if code == Code::Ok {
                        debug!(%method, ?code, ?elapsed, "rpc finished");
                    } else {
                        warn!(%method, ?code, ?elapsed, "rpc failed");
                    }
                }
                Err(e) => warn!(%method, ?elapsed, error = %e, "rpc transport error"),
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use similar_asserts::assert_eq;
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn parses_unix_and_tcp_targets() {
        assert_eq!(
            parse_target(DEFAULT_TARGET).expect("unix"),
            Target::Unix(PathBuf::from("/var/run/nvidia-device-api/device-api.sock"))
        );
        assert_eq!(
            parse_target("127.0.0.1:50051").expect("tcp"),
            Target::Http("http://127.0.0.1:50051".to_string())
        );
        assert!(parse_target("unix://relative.sock").is_err());
        assert!(parse_target("").is_err());
    }

    #[test]
    fn defaults_match_the_documented_keepalive() {
        let options = DialOptions::default();
        assert_eq!(options.target, DEFAULT_TARGET);
        assert_eq!(options.keepalive_interval, Duration::from_secs(300));
        assert_eq!(options.keepalive_timeout, Duration::from_secs(20));
        assert!(options.keepalive_while_idle);
    }

    #[test]
    fn with_socket_builds_unix_target() {
        let options = DialOptions::default().with_socket("/tmp/x/device-api.sock");
        assert_eq!(options.target, "unix:///tmp/x/device-api.sock");
    }

    #[tokio::test]
    async fn latency_logging_passes_responses_through() {
        let inner = service_fn(|req: http::Request<()>| async move {
            let status = if req.uri().path().ends_with("Missing") { "5" } else { "0" };
            Ok::<_, Infallible>(
                http::Response::builder()
                    .header("grpc-status", status)
                    .body(())
                    .expect("response"),
            )
        });
        let svc = LatencyLogging::new(inner);

        let response = svc
            .oneshot(
                http::Request::builder()
                    .uri("/nvidia.device.v1alpha1.GpuService/Missing")
                    .body(())
                    .expect("request"),
            )
            .await
            .expect("infallible");

        assert_eq!(
            response.headers().get("grpc-status").map(|v| v.as_bytes()),
            Some(&b"5"[..])
        );
    }
}
