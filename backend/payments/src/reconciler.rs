//! Provider callback reconciliation.
//!
//! Each provider posts its own payload shape. [`normalize`] reduces it to a
//! correlation reference and an outcome; [`apply`] looks the record up by
//! external reference and hands the outcome to the store's compare-and-set.
//! Redelivery of a terminal callback is therefore a no-op that still
//! acknowledges.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::contribution::{Contribution, ContributionStatus, PaymentMethod};
use crate::errors::{PaymentError, Result};
use crate::store::{ContributionStore, Transition};

/// Provider-neutral callback.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCallback {
    pub correlation_ref: String,
    /// `Processing`, `Completed` or `Failed`.
    pub outcome: ContributionStatus,
}

/// Result of a reconciled callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    Applied(Contribution),
    /// Record was already at or past the outcome.
    Unchanged(Contribution),
}

impl Ack {
    pub fn contribution(&self) -> &Contribution {
        match self {
            Self::Applied(c) | Self::Unchanged(c) => c,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Payload shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MpesaCallback {
    #[serde(rename = "Body")]
    body: MpesaBody,
}

#[derive(Debug, Deserialize)]
struct MpesaBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    /// Daraja sends a number; some relays stringify it.
    #[serde(rename = "ResultCode")]
    result_code: Option<Value>,
    #[serde(rename = "ResultDesc")]
    result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata")]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AirtelCallback {
    transaction: AirtelTransaction,
}

#[derive(Debug, Deserialize)]
struct AirtelTransaction {
    id: Option<String>,
    status_code: Option<String>,
    status: Option<String>,
    airtel_money_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SelcomCallback {
    order_id: Option<String>,
    payment_status: Option<String>,
    transid: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Normalization
// ─────────────────────────────────────────────────────────

fn uncorrelated(provider: PaymentMethod, reason: impl Into<String>) -> PaymentError {
    PaymentError::UncorrelatedCallback {
        provider,
        reason: reason.into(),
    }
}

/// Only a JSON syntax error is malformed; a body of the wrong shape is
/// merely uncorrelated.
fn decode<T: serde::de::DeserializeOwned>(provider: PaymentMethod, raw: &[u8]) -> Result<T> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| PaymentError::MalformedCallback {
        provider,
        reason: e.to_string(),
    })?;
    serde_json::from_value(value).map_err(|e| uncorrelated(provider, e.to_string()))
}

fn required(
    provider: PaymentMethod,
    field: &str,
    value: Option<String>,
) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| uncorrelated(provider, format!("missing {field}")))
}

fn mpesa_outcome(result_code: Option<&Value>) -> ContributionStatus {
    let code = match result_code {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    match code {
        Some(0) => ContributionStatus::Completed,
        _ => ContributionStatus::Failed,
    }
}

fn airtel_outcome(code: &str) -> ContributionStatus {
    match code.trim().to_ascii_uppercase().as_str() {
        "TS" => ContributionStatus::Completed,
        "TIP" | "TA" => ContributionStatus::Processing,
        _ => ContributionStatus::Failed,
    }
}

fn selcom_outcome(code: &str) -> ContributionStatus {
    match code.trim().to_ascii_uppercase().as_str() {
        "COMPLETED" | "SUCCESS" => ContributionStatus::Completed,
        "PENDING" | "INPROGRESS" => ContributionStatus::Processing,
        _ => ContributionStatus::Failed,
    }
}

/// Reduce a raw provider payload. Unknown status codes map to `Failed`.
///
/// Returns [`PaymentError::MalformedCallback`] for a body that is not JSON
/// and [`PaymentError::UncorrelatedCallback`] when no reference can be read.
pub fn normalize(provider: PaymentMethod, raw: &[u8]) -> Result<NormalizedCallback> {
    match provider {
        PaymentMethod::Mpesa => {
            let payload: MpesaCallback = decode(provider, raw)?;
            let stk = payload.body.stk_callback;
            let correlation_ref = required(provider, "CheckoutRequestID", stk.checkout_request_id)?;
            let outcome = mpesa_outcome(stk.result_code.as_ref());

            let receipt = stk
                .callback_metadata
                .iter()
                .flat_map(|m| m.items.iter())
                .find(|item| item.name == "MpesaReceiptNumber")
                .and_then(|item| item.value.as_ref());
            if let Some(receipt) = receipt {
                info!(checkout_id = %correlation_ref, receipt = %receipt, "M-Pesa receipt");
            }
            if outcome == ContributionStatus::Failed {
                debug!(
                    checkout_id = %correlation_ref,
                    "M-Pesa payment not completed: {}",
                    stk.result_desc.as_deref().unwrap_or("no description")
                );
            }

            Ok(NormalizedCallback {
                correlation_ref,
                outcome,
            })
        }
        PaymentMethod::Airtel => {
            let payload: AirtelCallback = decode(provider, raw)?;
            let tx = payload.transaction;
            let correlation_ref = required(provider, "transaction.id", tx.id)?;
            let code = tx.status_code.or(tx.status).unwrap_or_default();
            if let Some(money_id) = &tx.airtel_money_id {
                debug!(transaction_id = %correlation_ref, airtel_money_id = %money_id, "Airtel Money transaction");
            }

            Ok(NormalizedCallback {
                correlation_ref,
                outcome: airtel_outcome(&code),
            })
        }
        PaymentMethod::Selcom => {
            let payload: SelcomCallback = decode(provider, raw)?;
            let correlation_ref = required(provider, "order_id", payload.order_id)?;
            if let Some(transid) = &payload.transid {
                debug!(order_id = %correlation_ref, transid = %transid, "Selcom transaction");
            }

            Ok(NormalizedCallback {
                correlation_ref,
                outcome: selcom_outcome(payload.payment_status.as_deref().unwrap_or_default()),
            })
        }
    }
}

// ─────────────────────────────────────────────────────────
// Application
// ─────────────────────────────────────────────────────────

/// Apply a normalized outcome through the store's compare-and-set.
///
/// Returns [`PaymentError::UnknownReference`] when no record carries the
/// reference; the store is left untouched in that case.
pub async fn apply(store: &dyn ContributionStore, callback: &NormalizedCallback) -> Result<Ack> {
    let record = store
        .find_by_reference(&callback.correlation_ref)
        .await?
        .ok_or_else(|| PaymentError::UnknownReference(callback.correlation_ref.clone()))?;

    match store.transition(&record.id, callback.outcome, None).await? {
        Transition::Applied(c) => {
            info!(
                contribution_id = %c.id,
                reference = %callback.correlation_ref,
                "Contribution {} -> {}",
                record.status,
                c.status
            );
            Ok(Ack::Applied(c))
        }
        Transition::Stale(c) => {
            debug!(
                contribution_id = %c.id,
                current = %c.status,
                requested = %callback.outcome,
                "Callback did not advance contribution"
            );
            Ok(Ack::Unchanged(c))
        }
    }
}

/// Normalize and apply one raw callback body.
pub async fn handle_callback(
    store: &dyn ContributionStore,
    provider: PaymentMethod,
    raw: &[u8],
) -> Result<Ack> {
    debug!(provider = %provider, "Callback body: {}", String::from_utf8_lossy(raw));

    let callback = normalize(provider, raw).inspect_err(|e| {
        warn!(provider = %provider, "Cannot reconcile callback: {e}");
    })?;
    apply(store, &callback).await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::contribution::NewContribution;
    use crate::store::InMemoryContributionStore;

    async fn processing(store: &InMemoryContributionStore, reference: &str) -> Contribution {
        let c = store
            .create(NewContribution {
                contributor_name: "Asha".to_string(),
                amount: 5000,
                phone_number: "255755123456".to_string(),
                payment_method: PaymentMethod::Mpesa,
                purpose: None,
            })
            .await
            .unwrap();
        store
            .transition(&c.id, ContributionStatus::Processing, Some(reference))
            .await
            .unwrap()
            .contribution()
            .clone()
    }

    fn mpesa_body(checkout_id: &str, result_code: Value) -> Vec<u8> {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": checkout_id,
                    "ResultCode": result_code,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "Amount", "Value": 5000 },
                            { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                            { "Name": "PhoneNumber", "Value": 255755123456u64 }
                        ]
                    }
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn mpesa_result_codes() {
        let ok = normalize(PaymentMethod::Mpesa, &mpesa_body("ws_1", json!(0))).unwrap();
        assert_eq!(ok.correlation_ref, "ws_1");
        assert_eq!(ok.outcome, ContributionStatus::Completed);

        let stringly = normalize(PaymentMethod::Mpesa, &mpesa_body("ws_1", json!("0"))).unwrap();
        assert_eq!(stringly.outcome, ContributionStatus::Completed);

        let cancelled = normalize(PaymentMethod::Mpesa, &mpesa_body("ws_1", json!(1032))).unwrap();
        assert_eq!(cancelled.outcome, ContributionStatus::Failed);
    }

    #[test]
    fn airtel_status_codes() {
        let cases = [
            (json!({ "transaction": { "id": "a", "status_code": "TS" } }), ContributionStatus::Completed),
            (json!({ "transaction": { "id": "a", "status": "TS" } }), ContributionStatus::Completed),
            (json!({ "transaction": { "id": "a", "status_code": "TIP" } }), ContributionStatus::Processing),
            (json!({ "transaction": { "id": "a", "status_code": "TF" } }), ContributionStatus::Failed),
            (json!({ "transaction": { "id": "a" } }), ContributionStatus::Failed),
        ];
        for (body, expected) in cases {
            let cb = normalize(PaymentMethod::Airtel, body.to_string().as_bytes()).unwrap();
            assert_eq!(cb.outcome, expected, "{body}");
        }
    }

    #[test]
    fn selcom_payment_statuses() {
        let cases = [
            ("COMPLETED", ContributionStatus::Completed),
            ("success", ContributionStatus::Completed),
            ("PENDING", ContributionStatus::Processing),
            ("REJECTED", ContributionStatus::Failed),
            ("SOMETHING_NEW", ContributionStatus::Failed),
        ];
        for (code, expected) in cases {
            let body = json!({ "order_id": "o1", "payment_status": code, "transid": "T1" });
            let cb = normalize(PaymentMethod::Selcom, body.to_string().as_bytes()).unwrap();
            assert_eq!(cb.correlation_ref, "o1");
            assert_eq!(cb.outcome, expected, "{code}");
        }
    }

    #[test]
    fn only_unparsable_bodies_are_malformed() {
        let err = normalize(PaymentMethod::Mpesa, b"not json").unwrap_err();
        assert!(matches!(err, PaymentError::MalformedCallback { .. }));

        let err = normalize(PaymentMethod::Airtel, br#"{"transaction":"#).unwrap_err();
        assert!(matches!(err, PaymentError::MalformedCallback { provider: PaymentMethod::Airtel, .. }));
    }

    #[test]
    fn json_without_reference_is_uncorrelated() {
        let err = normalize(PaymentMethod::Selcom, br#"{"payment_status":"COMPLETED"}"#).unwrap_err();
        assert!(matches!(err, PaymentError::UncorrelatedCallback { provider: PaymentMethod::Selcom, .. }));

        let err = normalize(PaymentMethod::Airtel, br#"{"transaction":{"id":""}}"#).unwrap_err();
        assert!(matches!(err, PaymentError::UncorrelatedCallback { .. }));

        let err = normalize(PaymentMethod::Airtel, br#"{"transaction":{"status_code":"TS"}}"#).unwrap_err();
        assert!(matches!(err, PaymentError::UncorrelatedCallback { ref reason, .. } if reason.contains("transaction.id")));

        // Wrong shape entirely, still JSON.
        let err = normalize(PaymentMethod::Mpesa, br#"{"hello":"world"}"#).unwrap_err();
        assert!(matches!(err, PaymentError::UncorrelatedCallback { .. }));
        let err = normalize(PaymentMethod::Selcom, br#""COMPLETED""#).unwrap_err();
        assert!(matches!(err, PaymentError::UncorrelatedCallback { .. }));
    }

    #[tokio::test]
    async fn uncorrelated_callback_leaves_store_untouched() {
        let store = InMemoryContributionStore::new();
        let c = processing(&store, "ws_CO_44").await;

        let err = handle_callback(&store, PaymentMethod::Airtel, br#"{"transaction":{"status_code":"TS"}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UncorrelatedCallback { .. }));
        assert_eq!(store.get(&c.id).await.unwrap(), Some(c));
    }

    #[tokio::test]
    async fn repeated_terminal_callback_changes_record_once() {
        let store = InMemoryContributionStore::new();
        let c = processing(&store, "ws_CO_42").await;
        let body = mpesa_body("ws_CO_42", json!(0));

        let first = handle_callback(&store, PaymentMethod::Mpesa, &body).await.unwrap();
        assert!(matches!(first, Ack::Applied(ref r) if r.status == ContributionStatus::Completed));

        let second = handle_callback(&store, PaymentMethod::Mpesa, &body).await.unwrap();
        assert!(matches!(second, Ack::Unchanged(_)));
        assert_eq!(second.contribution(), first.contribution());

        let stored = store.get(&c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContributionStatus::Completed);
    }

    #[tokio::test]
    async fn conflicting_terminal_callback_is_ignored() {
        let store = InMemoryContributionStore::new();
        let c = processing(&store, "ws_CO_43").await;

        handle_callback(&store, PaymentMethod::Mpesa, &mpesa_body("ws_CO_43", json!(1)))
            .await
            .unwrap();
        let ack = handle_callback(&store, PaymentMethod::Mpesa, &mpesa_body("ws_CO_43", json!(0)))
            .await
            .unwrap();

        assert!(matches!(ack, Ack::Unchanged(_)));
        assert_eq!(
            store.get(&c.id).await.unwrap().unwrap().status,
            ContributionStatus::Failed
        );
    }

    #[tokio::test]
    async fn unknown_reference_leaves_store_untouched() {
        let store = InMemoryContributionStore::new();
        let c = processing(&store, "known").await;

        let err = handle_callback(&store, PaymentMethod::Mpesa, &mpesa_body("unknown", json!(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UnknownReference(r) if r == "unknown"));
        assert_eq!(store.get(&c.id).await.unwrap(), Some(c));
    }

    #[tokio::test]
    async fn interim_status_does_not_regress() {
        let store = InMemoryContributionStore::new();
        let c = processing(&store, "order-7").await;

        let done = json!({ "order_id": "order-7", "payment_status": "COMPLETED" }).to_string();
        let late_pending = json!({ "order_id": "order-7", "payment_status": "PENDING" }).to_string();
        handle_callback(&store, PaymentMethod::Selcom, done.as_bytes()).await.unwrap();
        let ack = handle_callback(&store, PaymentMethod::Selcom, late_pending.as_bytes())
            .await
            .unwrap();

        assert!(matches!(ack, Ack::Unchanged(_)));
        assert_eq!(
            store.get(&c.id).await.unwrap().unwrap().status,
            ContributionStatus::Completed
        );
    }
}
