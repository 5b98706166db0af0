//! Shared state handed to every request handler.

use tokio_util::task::TaskTracker;

use crate::providers::{ProviderRegistry, SettlementScheduler};
use crate::store::SharedStore;

#[derive(Clone)]
pub struct AppContext {
    pub store: SharedStore,
    pub providers: ProviderRegistry,
    pub settlements: SettlementScheduler,
    /// Dialling prefix applied by phone normalization, e.g. `255`.
    pub phone_country_code: String,
    /// Initiations outlive the request that started them; drained on shutdown.
    pub initiations: TaskTracker,
}

impl AppContext {
    pub fn new(
        store: SharedStore,
        providers: ProviderRegistry,
        settlements: SettlementScheduler,
        phone_country_code: impl Into<String>,
    ) -> Self {
        Self {
            store,
            providers,
            settlements,
            phone_country_code: phone_country_code.into(),
            initiations: TaskTracker::new(),
        }
    }

    /// Wait for initiations already under way.
    pub async fn drain_initiations(&self) {
        self.initiations.close();
        self.initiations.wait().await;
    }
}
