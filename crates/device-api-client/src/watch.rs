//! Watch source: turns a server stream into a channel of decoded events.

use api_proto::event_type;
use api_proto::v1alpha1 as wire;
use api_types::Gpu;
use derive_more::Display;
use futures::Stream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tonic::Status;
use tracing::debug;
use tracing::warn;

/// Events buffered between the stream reader and the consumer.
const WATCH_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Progress marker carrying only a resource version.
    Bookmark(String),
    /// Terminal; nothing follows it.
    Error(StatusError),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum StatusReason {
    Expired,
    Forbidden,
    NotFound,
    InternalError,
}

impl StatusReason {
    fn from_wire(reason: &str, code: i32) -> Self {
        match reason {
            "Expired" | "Gone" => StatusReason::Expired,
            "Forbidden" => StatusReason::Forbidden,
            "NotFound" => StatusReason::NotFound,
            _ => match code {
                410 => StatusReason::Expired,
                403 => StatusReason::Forbidden,
                404 => StatusReason::NotFound,
                _ => StatusReason::InternalError,
            },
        }
    }

    /// HTTP-style code reported alongside the reason.
    pub const fn code(self) -> u16 {
        match self {
            StatusReason::Expired => 410,
            StatusReason::Forbidden => 403,
            StatusReason::NotFound => 404,
            StatusReason::InternalError => 500,
        }
    }
}

/// Terminal watch failure.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
#[display("{reason} ({code}): {message}")]
pub struct StatusError {
    pub code: u16,
    pub reason: StatusReason,
    pub message: String,
}

impl core::error::Error for StatusError {}

impl StatusError {
    pub fn new(reason: StatusReason, message: impl Into<String>) -> Self {
        Self {
            code: reason.code(),
            reason,
            message: message.into(),
        }
    }

    /// Maps a stream failure; `None` for a cancelled stream, which ends quietly.
    pub fn from_status(status: &Status) -> Option<Self> {
        let reason = match status.code() {
            Code::Cancelled => return None,
            Code::OutOfRange | Code::ResourceExhausted | Code::InvalidArgument => {
                StatusReason::Expired
            }
            Code::PermissionDenied => StatusReason::Forbidden,
            Code::NotFound => StatusReason::NotFound,
            _ => StatusReason::InternalError,
        };
        Some(Self::new(reason, status.message()))
    }

    pub fn from_wire(status: wire::WatchErrorStatus) -> Self {
        Self::new(StatusReason::from_wire(&status.reason, status.code), status.message)
    }

    /// The requested revision is gone; the consumer has to relist.
    pub fn is_expired(&self) -> bool {
        self.reason == StatusReason::Expired
    }
}

/// A watch message before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawWatchEvent<T> {
    pub type_: String,
    pub object: Option<T>,
    pub resource_version: String,
    pub status: Option<StatusError>,
}

impl From<wire::WatchGpusResponse> for RawWatchEvent<Gpu> {
    fn from(response: wire::WatchGpusResponse) -> Self {
        let resource_version = response
            .object
            .as_ref()
            .and_then(|o| o.metadata.as_ref())
            .map(|m| m.resource_version.clone())
            .unwrap_or_default();
        Self {
            type_: response.r#type,
            object: response.object.map(Gpu::from),
            resource_version,
            status: response.status.map(StatusError::from_wire),
        }
    }
}

enum Decoded<T> {
    Event(WatchEvent<T>),
    Terminal(StatusError),
    Skip,
}

impl<T> RawWatchEvent<T> {
    fn decode(self) -> Decoded<T> {
        let typed = |make: fn(T) -> WatchEvent<T>, object: Option<T>| match object {
            Some(object) => Decoded::Event(make(object)),
            None => {
                warn!("watch event without an object");
                Decoded::Skip
            }
        };
        match self.type_.as_str() {
            event_type::ADDED => typed(WatchEvent::Added, self.object),
            event_type::MODIFIED => typed(WatchEvent::Modified, self.object),
            event_type::DELETED => typed(WatchEvent::Deleted, self.object),
            event_type::BOOKMARK => Decoded::Event(WatchEvent::Bookmark(self.resource_version)),
            event_type::ERROR => Decoded::Terminal(self.status.unwrap_or_else(|| {
                StatusError::new(StatusReason::InternalError, "watch error without status")
            })),
            other => {
                warn!(event_type = other, "ignoring unknown watch event type");
                Decoded::Skip
            }
        }
    }
}

/// Decoded events from one watch stream.
///
/// The channel closes when the stream ends, after a terminal
/// [`WatchEvent::Error`], or once [`Watcher::stop`] is called.
#[derive(Debug)]
pub struct Watcher<T> {
    events: mpsc::Receiver<WatchEvent<T>>,
    stop: CancellationToken,
}

impl<T: Send + 'static> Watcher<T> {
    /// Starts a reader task over `stream`.
    pub fn spawn<S, R>(stream: S) -> Self
    where
        S: Stream<Item = Result<R, Status>> + Send + Unpin + 'static,
        R: Into<RawWatchEvent<T>> + Send + 'static,
    {
        let (tx, events) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let stop = CancellationToken::new();
        tokio::spawn(read_stream(stream, tx, stop.clone()));
        Self { events, stop }
    }

    /// A watcher that yields `error` once and closes.
    pub fn failed(error: StatusError) -> Self {
        let (tx, events) = mpsc::channel(1);
        // Capacity is one and nothing else has sent.
        let _ = tx.try_send(WatchEvent::Error(error));
        Self {
            events,
            stop: CancellationToken::new(),
        }
    }

    /// A watcher that is already closed.
    pub fn closed() -> Self {
        let (_, events) = mpsc::channel(1);
        Self {
            events,
            stop: CancellationToken::new(),
        }
    }
}

impl<T> Watcher<T> {
    /// Next event, or `None` once the watch has ended.
    pub async fn recv(&mut self) -> Option<WatchEvent<T>> {
        self.events.recv().await
    }

    /// Cancels the underlying stream. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn read_stream<T, S, R>(mut stream: S, tx: mpsc::Sender<WatchEvent<T>>, stop: CancellationToken)
where
    S: Stream<Item = Result<R, Status>> + Unpin,
    R: Into<RawWatchEvent<T>>,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            item = stream.next() => item,
        };
        let event = match item {
            None => {
                debug!("watch stream ended");
                break;
            }
            Some(Ok(raw)) => match raw.into().decode() {
                Decoded::Event(event) => event,
                Decoded::Terminal(error) => {
                    deliver(&tx, &stop, WatchEvent::Error(error)).await;
                    break;
                }
                Decoded::Skip => continue,
            },
            Some(Err(status)) => {
                match StatusError::from_status(&status) {
                    Some(error) => {
                        debug!(code = ?status.code(), %error, "watch stream failed");
                        deliver(&tx, &stop, WatchEvent::Error(error)).await;
                    }
                    None => debug!("watch stream cancelled"),
                }
                break;
            }
        };
        if !deliver(&tx, &stop, event).await {
            break;
        }
    }
    // Dropping `stream` cancels the RPC; dropping `tx` closes the channel.
}

async fn deliver<T>(tx: &mpsc::Sender<WatchEvent<T>>, stop: &CancellationToken, event: WatchEvent<T>) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}
