//! Client-side status poller.
//!
//! [`watch_status`] spawns one task that reads a contribution's status at a
//! fixed interval (first read immediately) until it turns terminal or the
//! attempt budget runs out. It never writes; callbacks remain the only source
//! of truth, so a payment that completes after the poller has given up is
//! still recorded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contribution::StatusSnapshot;
use crate::errors::{PaymentError, Result};
use crate::store::{ContributionStore, SharedStore};

// ─────────────────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<StatusSnapshot>;
}

/// Reads `GET <base>/check-payment-status?id=<id>` on a running service.
pub struct HttpStatusSource {
    client: Client,
    base_url: String,
}

impl HttpStatusSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self, id: &str) -> Result<StatusSnapshot> {
        let resp = self
            .client
            .get(format!("{}/check-payment-status", self.base_url))
            .query(&[("id", id)])
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(PaymentError::NotFound(id.to_string()));
        }
        let snapshot = resp.error_for_status()?.json().await?;
        Ok(snapshot)
    }
}

/// Reads straight from the store, for in-process watchers.
pub struct StoreStatusSource {
    store: SharedStore,
}

impl StoreStatusSource {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatusSource for StoreStatusSource {
    async fn fetch(&self, id: &str) -> Result<StatusSnapshot> {
        self.store
            .get(id)
            .await?
            .map(StatusSnapshot::from)
            .ok_or_else(|| PaymentError::NotFound(id.to_string()))
    }
}

// ─────────────────────────────────────────────────────────
// Watch
// ─────────────────────────────────────────────────────────

/// Receives progress from a running watch. `on_terminal` and `on_timeout`
/// are mutually exclusive and called at most once.
pub trait StatusObserver: Send + Sync {
    fn on_update(&self, _snapshot: &StatusSnapshot) {}

    fn on_terminal(&self, snapshot: &StatusSnapshot);

    fn on_timeout(&self, attempts: u32, last: Option<&StatusSnapshot>);
}

/// Floor for [`PollerConfig::interval`]; a zero period is raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    Terminal(StatusSnapshot),
    TimedOut {
        attempts: u32,
        last: Option<StatusSnapshot>,
    },
    Cancelled,
}

impl WatchOutcome {
    pub fn into_result(self, contribution_id: &str) -> Result<StatusSnapshot> {
        match self {
            Self::Terminal(snapshot) => Ok(snapshot),
            Self::TimedOut { attempts, .. } => Err(PaymentError::PollTimeout {
                contribution_id: contribution_id.to_string(),
                attempts,
            }),
            Self::Cancelled => Err(PaymentError::WatchCancelled(contribution_id.to_string())),
        }
    }
}

/// Owns a running watch. Dropping the handle cancels it.
pub struct WatchHandle {
    contribution_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<WatchOutcome>>,
}

impl WatchHandle {
    pub fn contribution_id(&self) -> &str {
        &self.contribution_id
    }

    /// Stop future reads, aborting a read already in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the watch to end.
    pub async fn outcome(mut self) -> WatchOutcome {
        let Some(task) = self.task.take() else {
            return WatchOutcome::Cancelled;
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(contribution_id = %self.contribution_id, "Status watch task ended abnormally: {e}");
                WatchOutcome::Cancelled
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start watching `contribution_id`.
pub fn watch_status(
    source: Arc<dyn StatusSource>,
    contribution_id: impl Into<String>,
    config: PollerConfig,
    observer: Arc<dyn StatusObserver>,
) -> WatchHandle {
    let contribution_id = contribution_id.into();
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run(
        source,
        contribution_id.clone(),
        config,
        observer,
        cancel.clone(),
    ));

    WatchHandle {
        contribution_id,
        cancel,
        task: Some(task),
    }
}

async fn run(
    source: Arc<dyn StatusSource>,
    id: String,
    config: PollerConfig,
    observer: Arc<dyn StatusObserver>,
    cancel: CancellationToken,
) -> WatchOutcome {
    let mut ticker = tokio::time::interval(config.interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut attempts = 0u32;
    let mut last: Option<StatusSnapshot> = None;

    while attempts < config.max_attempts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return WatchOutcome::Cancelled,
            _ = ticker.tick() => {}
        }
        attempts += 1;

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WatchOutcome::Cancelled,
            read = source.fetch(&id) => read,
        };

        match read {
            Ok(snapshot) if snapshot.status.is_terminal() => {
                info!(contribution_id = %id, status = %snapshot.status, attempts, "Contribution reached terminal status");
                observer.on_terminal(&snapshot);
                return WatchOutcome::Terminal(snapshot);
            }
            Ok(snapshot) => {
                debug!(contribution_id = %id, status = %snapshot.status, attempts, "Contribution not settled yet");
                observer.on_update(&snapshot);
                last = Some(snapshot);
            }
            Err(e) => {
                warn!(contribution_id = %id, attempts, "Status read failed: {e}");
            }
        }
    }

    info!(contribution_id = %id, attempts, "Gave up waiting for terminal status");
    observer.on_timeout(attempts, last.as_ref());
    WatchOutcome::TimedOut { attempts, last }
}
