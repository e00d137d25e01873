//! Prometheus series exported on the metrics endpoint

use std::time::Duration;

use core::error::Error;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;

#[derive(Debug, Display)]
#[display("failed to set up metrics")]
pub struct MetricsError;

impl Error for MetricsError {}

/// Every series the server reports, registered on a private registry.
#[derive(Clone)]
pub struct ServerMetrics {
    registry: Registry,
    pub grpc_requests: IntCounterVec,
    pub grpc_duration: HistogramVec,
    pub watch_streams: IntGaugeVec,
    pub storage_revision: IntGauge,
    pub compacted_revision: IntGauge,
    pub watch_events_dropped: IntCounter,
}

impl ServerMetrics {
    pub fn new() -> Result<Self, Report<MetricsError>> {
        let registry = Registry::new();

        let grpc_requests = IntCounterVec::new(
            Opts::new(
                "device_api_grpc_requests_total",
                "gRPC requests handled, by method and status code",
            ),
            &["method", "code"],
        )
        .map_err(metric_error)?;
        let grpc_duration = HistogramVec::new(
            HistogramOpts::new(
                "device_api_grpc_request_duration_seconds",
                "Latency of unary gRPC requests",
            ),
            &["method"],
        )
        .map_err(metric_error)?;
        let watch_streams = IntGaugeVec::new(
            Opts::new("device_api_watch_streams", "Open watch streams by resource"),
            &["resource"],
        )
        .map_err(metric_error)?;
        let storage_revision = IntGauge::new(
            "device_api_storage_revision",
            "Most recent storage revision",
        )
        .map_err(metric_error)?;
        let compacted_revision = IntGauge::new(
            "device_api_storage_compacted_revision",
            "Revision up to which history has been compacted",
        )
        .map_err(metric_error)?;
        let watch_events_dropped = IntCounter::new(
            "device_api_watch_events_dropped_total",
            "Watchers evicted because their buffer overflowed",
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(grpc_requests.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(grpc_duration.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(watch_streams.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(storage_revision.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(compacted_revision.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(watch_events_dropped.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            grpc_requests,
            grpc_duration,
            watch_streams,
            storage_revision,
            compacted_revision,
            watch_events_dropped,
        })
    }

    pub fn observe_request(&self, method: &str, code: tonic::Code, elapsed: Duration) {
        self.grpc_requests
            .with_label_values(&[method, code_name(code)])
            .inc();
        self.grpc_duration
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }

    /// Text exposition of this registry plus the process-wide default one.
    pub fn render(&self) -> Result<String, Report<MetricsError>> {
        let mut families = self.registry.gather();
        families.extend(prometheus::gather());

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).change_context(MetricsError)
    }
}

fn metric_error(e: prometheus::Error) -> Report<MetricsError> {
    Report::new(MetricsError).attach_printable(e.to_string())
}

/// Canonical upper-snake gRPC code name.
pub fn code_name(code: tonic::Code) -> &'static str {
    use tonic::Code;
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}
