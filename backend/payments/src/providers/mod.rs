//! Mobile-money provider adapters.
//!
//! Every network sits behind [`PaymentProvider`]. The [`ProviderRegistry`]
//! maps a [`PaymentMethod`] to one adapter: the real one when its credentials
//! are configured, otherwise the [`SimulatedProvider`].

pub mod airtel;
pub mod mpesa;
pub mod selcom;
pub mod simulated;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use crate::config::Config;
use crate::contribution::PaymentMethod;
use crate::errors::AdapterError;

pub use airtel::AirtelProvider;
pub use mpesa::MpesaProvider;
pub use selcom::SelcomProvider;
pub use simulated::{SettlementScheduler, SimulatedProvider};

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    fn is_simulated(&self) -> bool {
        false
    }

    /// Ask the provider to collect `amount` from `phone`.
    ///
    /// `correlation_ref` is embedded in the request; the returned reference is
    /// the value the provider echoes back in its callback.
    async fn initiate(
        &self,
        amount: i64,
        phone: &str,
        correlation_ref: &str,
    ) -> Result<String, AdapterError>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under its own method, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Result<Arc<dyn PaymentProvider>, AdapterError> {
        self.providers
            .get(&method)
            .cloned()
            .ok_or_else(|| AdapterError::UnsupportedMethod(method.to_string()))
    }

    /// One adapter per method, chosen by credential presence.
    pub fn from_config(config: &Config, client: Client, settlements: SettlementScheduler) -> Self {
        let mut registry = Self::new();

        for method in PaymentMethod::ALL {
            let provider: Arc<dyn PaymentProvider> = match method {
                PaymentMethod::Mpesa => match &config.mpesa {
                    Some(cfg) => Arc::new(MpesaProvider::new(
                        client.clone(),
                        cfg.clone(),
                        config.callback_url("mpesa-callback"),
                    )),
                    None => Arc::new(SimulatedProvider::new(method, settlements.clone())),
                },
                PaymentMethod::Airtel => match &config.airtel {
                    Some(cfg) => Arc::new(AirtelProvider::new(client.clone(), cfg.clone())),
                    None => Arc::new(SimulatedProvider::new(method, settlements.clone())),
                },
                PaymentMethod::Selcom => match &config.selcom {
                    Some(cfg) => Arc::new(SelcomProvider::new(
                        client.clone(),
                        cfg.clone(),
                        config.callback_url("selcom-callback"),
                    )),
                    None => Arc::new(SimulatedProvider::new(method, settlements.clone())),
                },
            };

            if provider.is_simulated() {
                info!("{method}: credentials not configured, using simulated adapter");
            } else {
                info!("{method}: live adapter enabled");
            }
            registry.register(provider);
        }

        registry
    }
}

/// Map a reqwest failure into the adapter taxonomy.
pub(crate) fn transport(provider: PaymentMethod) -> impl Fn(reqwest::Error) -> AdapterError {
    move |source| AdapterError::Transport { provider, source }
}
