//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::contribution::{PaymentMethod, StatusSnapshot};
use crate::coordinator::{self, InitiateRequest};
use crate::errors::PaymentError;
use crate::reconciler;
use crate::store::ContributionStore;

const INITIATED_MESSAGE: &str =
    "Payment request sent to your phone. Please complete the transaction.";

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/initiate-payment", post(initiate_payment))
        .route(
            "/check-payment-status",
            get(check_payment_status).post(check_payment_status_body),
        )
        .route("/mpesa-callback", post(mpesa_callback))
        .route("/airtel-callback", post(airtel_callback))
        .route("/selcom-callback", post(selcom_callback))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

/// `id` or `contributionId`, from the query string or a JSON body.
#[derive(Debug, Default, Deserialize)]
pub struct StatusLookup {
    pub id: Option<String>,
    #[serde(rename = "contributionId")]
    pub contribution_id: Option<String>,
}

impl StatusLookup {
    fn into_id(self) -> Option<String> {
        self.id
            .or(self.contribution_id)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub success: bool,
    pub contribution_id: String,
    pub message: &'static str,
    pub payment_reference: String,
    pub phone_number: String,
}

#[derive(Serialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn acknowledged() -> Response {
    (
        StatusCode::OK,
        Json(AckResponse {
            success: true,
            error: None,
        }),
    )
        .into_response()
}

fn failed(error: impl ToString) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(AckResponse {
            success: false,
            error: Some(error.to_string()),
        }),
    )
        .into_response()
}

fn error_status(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /initiate-payment`
///
/// Accepts the request either flat or wrapped as `{"body": {...}}`. Every
/// failure is reported as 500 with `{success: false, error}`.
pub async fn initiate_payment(State(ctx): State<Arc<AppContext>>, body: Bytes) -> Response {
    let request = match parse_initiate(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Unreadable initiate-payment body: {e}");
            return failed(e);
        }
    };

    match coordinator::initiate(&ctx, request).await {
        Ok(initiated) => (
            StatusCode::OK,
            Json(InitiateResponse {
                success: true,
                contribution_id: initiated.contribution_id,
                message: INITIATED_MESSAGE,
                payment_reference: initiated.external_reference,
                phone_number: initiated.phone_number,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Error initiating payment: {e}");
            failed(e)
        }
    }
}

fn parse_initiate(body: &[u8]) -> Result<InitiateRequest, PaymentError> {
    let value: Value = serde_json::from_slice(body)?;
    let data = match value {
        Value::Object(mut map) => match map.remove("body") {
            Some(inner @ Value::Object(_)) => inner,
            Some(other) => {
                map.insert("body".to_string(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => other,
    };
    Ok(serde_json::from_value(data)?)
}

/// `GET /check-payment-status?id=…`
pub async fn check_payment_status(
    State(ctx): State<Arc<AppContext>>,
    Query(lookup): Query<StatusLookup>,
) -> Response {
    payment_status(&ctx, lookup.into_id()).await
}

/// `POST /check-payment-status` with `{"id": …}` or `{"contributionId": …}`.
pub async fn check_payment_status_body(
    State(ctx): State<Arc<AppContext>>,
    body: Bytes,
) -> Response {
    let lookup: StatusLookup = serde_json::from_slice(&body).unwrap_or_default();
    payment_status(&ctx, lookup.into_id()).await
}

async fn payment_status(ctx: &AppContext, id: Option<String>) -> Response {
    let Some(id) = id else {
        return error_status(StatusCode::BAD_REQUEST, "Contribution ID is required");
    };
    info!(contribution_id = %id, "Checking payment status");

    match ctx.store.get(&id).await {
        Ok(Some(contribution)) => {
            (StatusCode::OK, Json(StatusSnapshot::from(contribution))).into_response()
        }
        Ok(None) => error_status(StatusCode::NOT_FOUND, "Contribution not found"),
        Err(e) => {
            error!(contribution_id = %id, "Error fetching contribution: {e}");
            error_status(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// `POST /mpesa-callback`
pub async fn mpesa_callback(State(ctx): State<Arc<AppContext>>, body: Bytes) -> Response {
    callback(&ctx, PaymentMethod::Mpesa, &body).await
}

/// `POST /airtel-callback`
pub async fn airtel_callback(State(ctx): State<Arc<AppContext>>, body: Bytes) -> Response {
    callback(&ctx, PaymentMethod::Airtel, &body).await
}

/// `POST /selcom-callback`
pub async fn selcom_callback(State(ctx): State<Arc<AppContext>>, body: Bytes) -> Response {
    callback(&ctx, PaymentMethod::Selcom, &body).await
}

/// Providers retry on anything but 2xx, so only a body that is not JSON is
/// refused. Unknown or missing references are logged and acknowledged.
async fn callback(ctx: &AppContext, provider: PaymentMethod, body: &[u8]) -> Response {
    match reconciler::handle_callback(ctx.store.as_ref(), provider, body).await {
        Ok(_) => acknowledged(),
        Err(PaymentError::UnknownReference(reference)) => {
            warn!(provider = %provider, reference = %reference, "Callback for unknown reference acknowledged");
            acknowledged()
        }
        Err(PaymentError::UncorrelatedCallback { reason, .. }) => {
            warn!(provider = %provider, "Uncorrelated callback acknowledged: {reason}");
            acknowledged()
        }
        Err(e) => {
            error!(provider = %provider, "Error processing callback: {e}");
            failed(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_body_is_unwrapped() {
        let req = parse_initiate(
            br#"{"body":{"amount":5000,"phoneNumber":"0755123456","paymentMethod":"mpesa","contributorName":"Asha"}}"#,
        )
        .unwrap();
        assert_eq!(req.amount, Some(5000));
        assert_eq!(req.contributor_name.as_deref(), Some("Asha"));
    }

    #[test]
    fn flat_body_is_accepted() {
        let req = parse_initiate(
            br#"{"amount":100,"phoneNumber":"0755123456","paymentMethod":"airtel","contributorName":"Juma","purpose":"Harambee"}"#,
        )
        .unwrap();
        assert_eq!(req.payment_method.as_deref(), Some("airtel"));
        assert_eq!(req.purpose.as_deref(), Some("Harambee"));
    }

    #[test]
    fn garbage_body_is_an_error() {
        assert!(matches!(parse_initiate(b"{oops"), Err(PaymentError::Json(_))));
    }

    #[test]
    fn lookup_prefers_id_then_alias() {
        let both: StatusLookup =
            serde_json::from_str(r#"{"id":"a","contributionId":"b"}"#).unwrap();
        assert_eq!(both.into_id().as_deref(), Some("a"));

        let alias: StatusLookup = serde_json::from_str(r#"{"contributionId":"b"}"#).unwrap();
        assert_eq!(alias.into_id().as_deref(), Some("b"));

        let blank: StatusLookup = serde_json::from_str(r#"{"id":"  "}"#).unwrap();
        assert_eq!(blank.into_id(), None);
    }
}
