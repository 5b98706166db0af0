//! Stand-in adapter for providers without credentials.
//!
//! No network traffic. The adapter synthesizes `TEST_<METHOD>_<ref>` and asks
//! the [`SettlementScheduler`] to complete the payment after a fixed delay.
//! Settlements go through [`reconciler::apply`], the same compare-and-set path
//! a real callback takes, so a callback that lands first still wins.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::PaymentProvider;
use crate::contribution::{ContributionStatus, PaymentMethod};
use crate::errors::{AdapterError, PaymentError};
use crate::reconciler::{self, Ack, NormalizedCallback};
use crate::store::SharedStore;

// ─────────────────────────────────────────────────────────
// Settlement scheduler
// ─────────────────────────────────────────────────────────

/// Owns every pending simulated settlement.
///
/// Tasks are tracked so they can be counted and drained, and each one hangs
/// off a shared shutdown token.
#[derive(Clone)]
pub struct SettlementScheduler {
    store: SharedStore,
    delay: Duration,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl SettlementScheduler {
    pub fn new(store: SharedStore, delay: Duration) -> Self {
        Self {
            store,
            delay,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Complete `reference` after the configured delay.
    ///
    /// The returned token cancels this settlement only.
    pub fn schedule(&self, reference: String) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();
        let store = self.store.clone();
        let delay = self.delay;

        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(reference = %reference, "Simulated settlement cancelled");
                }
                _ = settle(store, &reference, delay) => {}
            }
        });

        cancel
    }

    /// Settlements scheduled but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel everything outstanding and wait for the tasks to exit.
    pub async fn shutdown(&self) {
        let outstanding = self.tracker.len();
        if outstanding > 0 {
            info!("Cancelling {outstanding} pending simulated settlement(s)");
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// The coordinator records the reference only after the adapter returns, so
/// a short delay can fire first. Unknown references are retried for a while.
const REFERENCE_RETRIES: u32 = 50;
const REFERENCE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

async fn settle(store: SharedStore, reference: &str, delay: Duration) {
    tokio::time::sleep(delay).await;

    let callback = NormalizedCallback {
        correlation_ref: reference.to_string(),
        outcome: ContributionStatus::Completed,
    };
    for attempt in 1..=REFERENCE_RETRIES {
        match reconciler::apply(store.as_ref(), &callback).await {
            Ok(Ack::Applied(c)) => {
                info!(contribution_id = %c.id, reference, "Simulated payment settled");
                return;
            }
            Ok(Ack::Unchanged(c)) => {
                debug!(contribution_id = %c.id, status = %c.status, "Simulated settlement skipped, record already moved on");
                return;
            }
            Err(PaymentError::UnknownReference(_)) if attempt < REFERENCE_RETRIES => {
                debug!(reference, attempt, "Reference not recorded yet");
                tokio::time::sleep(REFERENCE_RETRY_INTERVAL).await;
            }
            Err(PaymentError::UnknownReference(r)) => {
                warn!(reference = %r, attempts = attempt, "Simulated settlement found no matching contribution");
                return;
            }
            Err(e) => {
                warn!(reference, "Simulated settlement failed: {e}");
                return;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────

pub struct SimulatedProvider {
    method: PaymentMethod,
    settlements: SettlementScheduler,
}

impl SimulatedProvider {
    pub fn new(method: PaymentMethod, settlements: SettlementScheduler) -> Self {
        Self {
            method,
            settlements,
        }
    }
}

pub(crate) fn simulated_reference(method: PaymentMethod, correlation_ref: &str) -> String {
    format!(
        "TEST_{}_{correlation_ref}",
        method.as_str().to_ascii_uppercase()
    )
}

#[async_trait]
impl PaymentProvider for SimulatedProvider {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    fn is_simulated(&self) -> bool {
        true
    }

    async fn initiate(
        &self,
        amount: i64,
        phone: &str,
        correlation_ref: &str,
    ) -> Result<String, AdapterError> {
        let reference = simulated_reference(self.method, correlation_ref);
        info!(
            provider = %self.method,
            amount,
            phone,
            reference = %reference,
            "Simulated payment request, settling in {:?}",
            self.settlements.delay()
        );
        self.settlements.schedule(reference.clone());
        Ok(reference)
    }
}
