//! The list-then-watch loop that keeps an informer's cache current.

use std::sync::Arc;
use std::time::Duration;

use api_types::Resource;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::ClientResult;
use crate::informer::InformerState;
use crate::watch::StatusError;
use crate::watch::WatchEvent;
use crate::watch::Watcher;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Pause before reopening a watch the server closed cleanly.
const REWATCH_DELAY: Duration = Duration::from_millis(100);

/// Source of list snapshots and watches for one resource kind.
#[async_trait::async_trait]
pub trait ListerWatcher<T>: Send + Sync {
    /// Every object in scope, plus the revision the snapshot was taken at.
    async fn list(&self) -> ClientResult<(Vec<T>, String)>;

    /// Events strictly after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Watcher<T>;
}

/// Exponential retry delay, doubling up to a cap.
#[derive(Debug)]
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: INITIAL_RETRY_DELAY,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = std::cmp::min(self.delay * 2, MAX_RETRY_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.delay = INITIAL_RETRY_DELAY;
    }
}

enum WatchOutcome {
    Cancelled,
    Expired(StatusError),
    Failed(StatusError),
    Closed,
}

pub(crate) struct Reflector<T: Resource> {
    lister_watcher: Arc<dyn ListerWatcher<T>>,
    state: Arc<InformerState<T>>,
    resync_period: Option<Duration>,
    backoff: Backoff,
}

impl<T: Resource> Reflector<T> {
    pub(crate) fn new(
        lister_watcher: Arc<dyn ListerWatcher<T>>,
        state: Arc<InformerState<T>>,
        resync_period: Option<Duration>,
    ) -> Self {
        Self {
            lister_watcher,
            state,
            resync_period,
            backoff: Backoff::new(),
        }
    }

    /// Runs until `cancel` fires.
    #[tracing::instrument(skip_all, fields(resource = T::DESCRIPTOR.plural))]
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        info!("Starting reflector");
        let mut resync = self.resync_period.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        'relist: loop {
            let listed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'relist,
                listed = self.lister_watcher.list() => listed,
            };
            let mut resource_version = match listed {
                Ok((items, resource_version)) => {
                    debug!(count = items.len(), %resource_version, "listed");
                    self.state.replace(items, &resource_version);
                    self.backoff.reset();
                    resource_version
                }
                Err(e) => {
                    let delay = self.backoff.next();
                    warn!(error = ?e, ?delay, "list failed, retrying");
                    if !sleep(delay, &cancel).await {
                        break 'relist;
                    }
                    continue 'relist;
                }
            };

            loop {
                let mut watcher = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'relist,
                    watcher = self.lister_watcher.watch(&resource_version) => watcher,
                };
                let outcome = self
                    .consume(&mut watcher, &mut resource_version, &mut resync, &cancel)
                    .await;
                watcher.stop();

                match outcome {
                    WatchOutcome::Cancelled => break 'relist,
                    WatchOutcome::Expired(e) => {
                        info!(%resource_version, reason = %e, "watch expired, relisting");
                        continue 'relist;
                    }
                    WatchOutcome::Failed(e) => {
                        let delay = self.backoff.next();
                        warn!(%resource_version, error = %e, ?delay, "watch failed, reopening");
                        if !sleep(delay, &cancel).await {
                            break 'relist;
                        }
                    }
                    WatchOutcome::Closed => {
                        debug!(%resource_version, "watch closed by server, reopening");
                        if !sleep(REWATCH_DELAY, &cancel).await {
                            break 'relist;
                        }
                    }
                }
            }
        }
        info!("Reflector stopped");
    }

    async fn consume(
        &mut self,
        watcher: &mut Watcher<T>,
        resource_version: &mut String,
        resync: &mut Option<Interval>,
        cancel: &CancellationToken,
    ) -> WatchOutcome {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatchOutcome::Cancelled,
                _ = next_tick(resync) => {
                    self.state.resync();
                    continue;
                }
                event = watcher.recv() => event,
            };
            match event {
                None => return WatchOutcome::Closed,
                Some(WatchEvent::Error(e)) if e.is_expired() => return WatchOutcome::Expired(e),
                Some(WatchEvent::Error(e)) => return WatchOutcome::Failed(e),
                Some(WatchEvent::Bookmark(rv)) => {
                    if !rv.is_empty() {
                        *resource_version = rv;
                        self.state.set_resource_version(resource_version);
                    }
                }
                Some(event) => {
                    if let Some(rv) = self.state.apply(event) {
                        *resource_version = rv;
                    }
                    self.backoff.reset();
                }
            }
        }
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

/// Sleeps for `delay`; false if cancelled first.
async fn sleep(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
