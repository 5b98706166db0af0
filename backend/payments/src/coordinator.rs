//! Payment initiation.
//!
//! One call creates exactly one `pending` contribution, asks the selected
//! adapter to push the payment using the contribution id as correlation
//! reference, then records the provider's reference and moves the record to
//! `processing` in a single compare-and-set. Any adapter failure leaves the
//! record `failed`.
//!
//! Everything after validation runs on a task of its own, so a caller that
//! stops waiting (a client hanging up mid provider call) cannot strand the
//! record at `pending`.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::contribution::{ContributionStatus, NewContribution, PaymentMethod};
use crate::errors::{PaymentError, Result};
use crate::providers::PaymentProvider;
use crate::store::{ContributionStore, SharedStore, Transition};

/// Shortest subscriber number accepted after normalization.
const MIN_PHONE_DIGITS: usize = 9;

/// Body of `POST /initiate-payment`. Fields are optional so that a missing
/// one surfaces as a validation error rather than a decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub amount: Option<i64>,
    pub phone_number: Option<String>,
    pub payment_method: Option<String>,
    pub contributor_name: Option<String>,
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Initiated {
    pub contribution_id: String,
    pub external_reference: String,
    /// Normalized number the push was sent to.
    pub phone_number: String,
}

/// Canonical international form without `+`.
///
/// `0755 123 456` → `255755123456`, `+255 755 123 456` → `255755123456`,
/// `755123456` → `255755123456`. Anything else keeps its digits.
pub fn normalize_phone(raw: &str, country_code: &str) -> Result<String> {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(rest) = digits.strip_prefix("00") {
        digits = rest.to_string();
    }

    let normalized = if let Some(local) = digits.strip_prefix('0') {
        format!("{country_code}{local}")
    } else if digits.len() == MIN_PHONE_DIGITS && !digits.starts_with(country_code) {
        format!("{country_code}{digits}")
    } else {
        digits
    };

    if normalized.len() < MIN_PHONE_DIGITS {
        return Err(PaymentError::Validation(format!(
            "Invalid phone number: '{raw}'"
        )));
    }
    Ok(normalized)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn initiate(ctx: &AppContext, req: InitiateRequest) -> Result<Initiated> {
    let (Some(amount), Some(phone), Some(method), Some(contributor_name)) = (
        req.amount,
        non_blank(req.phone_number),
        non_blank(req.payment_method),
        non_blank(req.contributor_name),
    ) else {
        return Err(PaymentError::Validation(
            "Missing required fields: amount, phoneNumber, paymentMethod, or contributorName"
                .to_string(),
        ));
    };

    if amount <= 0 {
        return Err(PaymentError::Validation(format!(
            "Amount must be positive, got {amount}"
        )));
    }
    let method: PaymentMethod = method.parse().map_err(PaymentError::Validation)?;
    let phone_number = normalize_phone(&phone, &ctx.phone_country_code)?;
    let provider = ctx.providers.get(method)?;

    let new = NewContribution {
        contributor_name,
        amount,
        phone_number,
        payment_method: method,
        purpose: non_blank(req.purpose),
    };
    let store = ctx.store.clone();
    ctx.initiations
        .spawn(run_initiation(store, provider, new))
        .await?
}

async fn run_initiation(
    store: SharedStore,
    provider: Arc<dyn PaymentProvider>,
    new: NewContribution,
) -> Result<Initiated> {
    let (method, amount, phone_number) = (new.payment_method, new.amount, new.phone_number.clone());
    let id = store.create(new).await?.id;
    info!(contribution_id = %id, provider = %method, amount, "Contribution created");

    let reference = match provider.initiate(amount, &phone_number, &id).await {
        Ok(reference) => reference,
        Err(source) => {
            error!(contribution_id = %id, provider = %method, "Payment initiation failed: {source}");
            mark_failed(store.as_ref(), &id).await;
            return Err(PaymentError::InitiationFailed {
                contribution_id: id,
                source,
            });
        }
    };

    match store
        .transition(&id, ContributionStatus::Processing, Some(&reference))
        .await
    {
        Ok(Transition::Applied(_)) => {
            info!(contribution_id = %id, reference = %reference, "Payment request sent");
        }
        Ok(Transition::Stale(current)) => {
            warn!(
                contribution_id = %id,
                status = %current.status,
                "Contribution moved on before the provider reference was recorded"
            );
        }
        Err(e) => {
            error!(contribution_id = %id, reference = %reference, "Could not record provider reference: {e}");
            mark_failed(store.as_ref(), &id).await;
            return Err(e);
        }
    }

    Ok(Initiated {
        contribution_id: id,
        external_reference: reference,
        phone_number,
    })
}

async fn mark_failed(store: &dyn ContributionStore, id: &str) {
    if let Err(e) = store.transition(id, ContributionStatus::Failed, None).await {
        error!(contribution_id = %id, "Could not mark contribution failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::errors::AdapterError;
    use crate::providers::{PaymentProvider, ProviderRegistry, SettlementScheduler, SimulatedProvider};
    use crate::store::InMemoryContributionStore;

    /// Returns a fixed reference, or `AuthFailed` when `reply` is `None`.
    struct StubProvider {
        method: PaymentMethod,
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl PaymentProvider for StubProvider {
        fn method(&self) -> PaymentMethod {
            self.method
        }

        async fn initiate(&self, _: i64, _: &str, _: &str) -> std::result::Result<String, AdapterError> {
            self.reply
                .map(str::to_string)
                .ok_or_else(|| AdapterError::AuthFailed {
                    provider: self.method,
                    reason: "bad credentials".to_string(),
                })
        }
    }

    fn context(store: &InMemoryContributionStore, registry: ProviderRegistry) -> AppContext {
        let store = Arc::new(store.clone());
        let settlements = SettlementScheduler::new(store.clone(), Duration::from_secs(5));
        AppContext::new(store, registry, settlements, "255")
    }

    fn request(method: &str) -> InitiateRequest {
        InitiateRequest {
            amount: Some(5000),
            phone_number: Some("0755123456".to_string()),
            payment_method: Some(method.to_string()),
            contributor_name: Some("Asha".to_string()),
            purpose: Some("  ".to_string()),
        }
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("0755123456", "255").unwrap(), "255755123456");
        assert_eq!(normalize_phone("255755123456", "255").unwrap(), "255755123456");
        assert_eq!(normalize_phone("+255 755 123 456", "255").unwrap(), "255755123456");
        assert_eq!(normalize_phone("00255755123456", "255").unwrap(), "255755123456");
        assert_eq!(normalize_phone("755123456", "255").unwrap(), "255755123456");
        assert_eq!(normalize_phone("0712 345 678", "254").unwrap(), "254712345678");
        assert!(matches!(normalize_phone("", "255"), Err(PaymentError::Validation(_))));
        assert!(matches!(normalize_phone("+ -", "255"), Err(PaymentError::Validation(_))));
    }

    #[tokio::test]
    async fn success_records_reference_and_processing() {
        let store = InMemoryContributionStore::new();
        let registry = ProviderRegistry::new().with(Arc::new(StubProvider {
            method: PaymentMethod::Mpesa,
            reply: Some("ws_CO_1"),
        }));
        let ctx = context(&store, registry);

        let out = initiate(&ctx, request("mpesa")).await.unwrap();
        assert_eq!(out.external_reference, "ws_CO_1");
        assert_eq!(out.phone_number, "255755123456");

        let stored = store.get(&out.contribution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContributionStatus::Processing);
        assert_eq!(stored.external_reference.as_deref(), Some("ws_CO_1"));
        assert_eq!(stored.phone_number, "255755123456");
        assert_eq!(stored.purpose, None);
    }

    #[tokio::test]
    async fn auth_failure_is_contained_as_failed_record() {
        let store = InMemoryContributionStore::new();
        let registry = ProviderRegistry::new().with(Arc::new(StubProvider {
            method: PaymentMethod::Airtel,
            reply: None,
        }));
        let ctx = context(&store, registry);

        let (contribution_id, source) = match initiate(&ctx, request("airtel")).await {
            Err(PaymentError::InitiationFailed { contribution_id, source }) => (contribution_id, source),
            other => panic!("expected InitiationFailed, got {other:?}"),
        };
        assert!(matches!(source, AdapterError::AuthFailed { .. }));

        let stored = store.get(&contribution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContributionStatus::Failed);
        assert!(stored.external_reference.is_none());
    }

    #[tokio::test]
    async fn invalid_input_creates_no_record() {
        let store = InMemoryContributionStore::new();
        let registry = ProviderRegistry::new().with(Arc::new(StubProvider {
            method: PaymentMethod::Mpesa,
            reply: Some("r"),
        }));
        let ctx = context(&store, registry);

        let mut zero = request("mpesa");
        zero.amount = Some(0);
        let mut nameless = request("mpesa");
        nameless.contributor_name = Some("   ".to_string());
        let mut no_phone = request("mpesa");
        no_phone.phone_number = None;

        for req in [zero, nameless, no_phone, request("tigopesa")] {
            let err = initiate(&ctx, req).await.unwrap_err();
            assert!(matches!(err, PaymentError::Validation(_)), "{err}");
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn unregistered_method_creates_no_record() {
        let store = InMemoryContributionStore::new();
        let ctx = context(&store, ProviderRegistry::new());

        let err = initiate(&ctx, request("selcom")).await.unwrap_err();
        assert!(matches!(err, PaymentError::Adapter(AdapterError::UnsupportedMethod(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn reused_provider_reference_fails_second_record() {
        let store = InMemoryContributionStore::new();
        let registry = ProviderRegistry::new().with(Arc::new(StubProvider {
            method: PaymentMethod::Mpesa,
            reply: Some("SAME"),
        }));
        let ctx = context(&store, registry);

        initiate(&ctx, request("mpesa")).await.unwrap();
        let err = initiate(&ctx, request("mpesa")).await.unwrap_err();
        assert!(matches!(err, PaymentError::DuplicateReference(_)));
        assert_eq!(store.len().await, 2);
    }

    /// Answers only after `SLOW`, like a provider stuck on a slow network.
    struct SlowProvider;

    const SLOW: Duration = Duration::from_secs(5);

    #[async_trait]
    impl PaymentProvider for SlowProvider {
        fn method(&self) -> PaymentMethod {
            PaymentMethod::Selcom
        }

        async fn initiate(&self, _: i64, _: &str, _: &str) -> std::result::Result<String, AdapterError> {
            tokio::time::sleep(SLOW).await;
            Ok("ORDER-slow".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_does_not_strand_record() {
        let store = InMemoryContributionStore::new();
        let ctx = context(&store, ProviderRegistry::new().with(Arc::new(SlowProvider)));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), initiate(&ctx, request("selcom"))).await;
        assert!(abandoned.is_err());
        assert_eq!(store.len().await, 1);

        tokio::time::sleep(SLOW + Duration::from_secs(1)).await;
        ctx.drain_initiations().await;

        let stored = store.find_by_reference("ORDER-slow").await.unwrap().unwrap();
        assert_eq!(stored.status, ContributionStatus::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_initiation_in_progress() {
        let store = InMemoryContributionStore::new();
        let ctx = Arc::new(context(&store, ProviderRegistry::new().with(Arc::new(SlowProvider))));

        let caller = {
            let ctx = ctx.clone();
            tokio::spawn(async move { initiate(&ctx, request("selcom")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        ctx.drain_initiations().await;
        let stored = store.find_by_reference("ORDER-slow").await.unwrap();
        assert!(matches!(stored, Some(c) if c.status == ContributionStatus::Processing));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn immediate_settlements_never_strand_processing() {
        let store = InMemoryContributionStore::new();
        let shared = Arc::new(store.clone());
        let settlements = SettlementScheduler::new(shared.clone(), Duration::ZERO);
        let registry = ProviderRegistry::new().with(Arc::new(SimulatedProvider::new(
            PaymentMethod::Airtel,
            settlements.clone(),
        )));
        let ctx = AppContext::new(shared, registry, settlements.clone(), "255");

        let mut ids = Vec::new();
        for _ in 0..25 {
            ids.push(initiate(&ctx, request("airtel")).await.unwrap().contribution_id);
        }

        for _ in 0..100 {
            if settlements.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for id in ids {
            assert_eq!(
                store.get(&id).await.unwrap().unwrap().status,
                ContributionStatus::Completed
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_payment_completes_after_delay() {
        let store = InMemoryContributionStore::new();
        let shared = Arc::new(store.clone());
        let settlements = SettlementScheduler::new(shared.clone(), Duration::from_secs(5));
        let registry = ProviderRegistry::new().with(Arc::new(SimulatedProvider::new(
            PaymentMethod::Mpesa,
            settlements.clone(),
        )));
        let ctx = AppContext::new(shared, registry, settlements.clone(), "255");

        let out = initiate(&ctx, request("mpesa")).await.unwrap();
        assert_eq!(
            out.external_reference,
            format!("TEST_MPESA_{}", out.contribution_id)
        );
        let id = out.contribution_id;
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().status,
            ContributionStatus::Processing
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        while settlements.in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().status,
            ContributionStatus::Completed
        );
    }
}
