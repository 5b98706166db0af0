//! M-Pesa Daraja STK push.
//!
//! 1. `GET /oauth/v1/generate` with HTTP Basic credentials for a bearer token.
//! 2. `POST /mpesa/stkpush/v1/processrequest` to prompt the customer's phone.
//!
//! The callback is correlated on `CheckoutRequestID`, which is what
//! [`MpesaProvider::initiate`] returns.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{transport, PaymentProvider};
use crate::config::MpesaConfig;
use crate::contribution::PaymentMethod;
use crate::errors::AdapterError;

const PROVIDER: PaymentMethod = PaymentMethod::Mpesa;
/// Daraja rejects longer account references.
const ACCOUNT_REFERENCE_MAX: usize = 12;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: i64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    call_back_url: &'a str,
    account_reference: &'a str,
    transaction_desc: &'static str,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

pub struct MpesaProvider {
    client: Client,
    config: MpesaConfig,
    callback_url: String,
}

impl MpesaProvider {
    pub fn new(client: Client, config: MpesaConfig, callback_url: String) -> Self {
        Self {
            client,
            config,
            callback_url,
        }
    }

    async fn access_token(&self) -> Result<String, AdapterError> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );
        let resp = self
            .client
            .get(url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(transport(PROVIDER))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::AuthFailed {
                provider: PROVIDER,
                reason: format!("token endpoint returned {status}"),
            });
        }

        let body: TokenResponse = resp.json().await.map_err(|e| AdapterError::AuthFailed {
            provider: PROVIDER,
            reason: format!("unreadable token response: {e}"),
        })?;

        body.access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AdapterError::AuthFailed {
                provider: PROVIDER,
                reason: "token response carried no access_token".to_string(),
            })
    }
}

/// `base64(shortcode + passkey + timestamp)`, as Daraja expects.
pub(crate) fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{shortcode}{passkey}{timestamp}"))
}

/// Daraja timestamps are East Africa Time (UTC+3), `YYYYMMDDHHmmss`.
fn stk_timestamp() -> String {
    (Utc::now() + chrono::Duration::hours(3))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

#[async_trait]
impl PaymentProvider for MpesaProvider {
    fn method(&self) -> PaymentMethod {
        PROVIDER
    }

    async fn initiate(
        &self,
        amount: i64,
        phone: &str,
        correlation_ref: &str,
    ) -> Result<String, AdapterError> {
        let token = self.access_token().await?;

        let timestamp = stk_timestamp();
        let account_reference: String =
            correlation_ref.chars().take(ACCOUNT_REFERENCE_MAX).collect();
        let request = StkPushRequest {
            business_short_code: &self.config.shortcode,
            password: stk_password(&self.config.shortcode, &self.config.passkey, &timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount,
            party_a: phone,
            party_b: &self.config.shortcode,
            phone_number: phone,
            call_back_url: &self.callback_url,
            account_reference: &account_reference,
            transaction_desc: "Community Contribution",
        };

        let resp = self
            .client
            .post(format!("{}/mpesa/stkpush/v1/processrequest", self.config.base_url))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(transport(PROVIDER))?;

        let status = resp.status();
        let body: StkPushResponse = resp.json().await.map_err(|e| AdapterError::RequestRejected {
            provider: PROVIDER,
            code: Some(status.as_str().to_string()),
            message: format!("unreadable STK push response: {e}"),
        })?;
        debug!("M-Pesa STK push response: {body:?}");

        let accepted = status.is_success() && body.response_code.as_deref() == Some("0");
        if !accepted {
            return Err(AdapterError::RequestRejected {
                provider: PROVIDER,
                code: body
                    .error_code
                    .or(body.response_code)
                    .or_else(|| Some(status.as_str().to_string())),
                message: body
                    .error_message
                    .or(body.response_description)
                    .unwrap_or_else(|| "STK push not accepted".to_string()),
            });
        }

        let checkout_id = body
            .checkout_request_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AdapterError::RequestRejected {
                provider: PROVIDER,
                code: None,
                message: "response carried no CheckoutRequestID".to_string(),
            })?;

        info!(correlation_ref, checkout_id = %checkout_id, "M-Pesa STK push accepted");
        Ok(checkout_id)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::providers::mock;

    fn provider(base_url: String) -> MpesaProvider {
        MpesaProvider::new(
            Client::new(),
            MpesaConfig {
                consumer_key: "key".to_string(),
                consumer_secret: "secret".to_string(),
                shortcode: "174379".to_string(),
                passkey: "pass".to_string(),
                base_url,
            },
            "https://pay.example.org/mpesa-callback".to_string(),
        )
    }

    async fn token() -> Json<Value> {
        Json(json!({ "access_token": "tok", "expires_in": "3599" }))
    }

    #[test]
    fn password_is_base64_of_concatenation() {
        let pw = stk_password("174379", "pass", "20240101120000");
        let decoded = STANDARD.decode(pw).unwrap();
        assert_eq!(decoded, b"174379pass20240101120000");
    }

    #[test]
    fn timestamp_has_daraja_shape() {
        let ts = stk_timestamp();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn returns_checkout_request_id() {
        let app = Router::new()
            .route("/oauth/v1/generate", get(token))
            .route(
                "/mpesa/stkpush/v1/processrequest",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert_eq!(headers["authorization"], "Bearer tok");
                    assert_eq!(body["BusinessShortCode"], "174379");
                    assert_eq!(body["PhoneNumber"], "255755123456");
                    assert_eq!(body["Amount"], 5000);
                    assert_eq!(body["AccountReference"], "abcdefghijkl");
                    assert_eq!(body["CallBackURL"], "https://pay.example.org/mpesa-callback");
                    Json(json!({
                        "MerchantRequestID": "29115-34620561-1",
                        "CheckoutRequestID": "ws_CO_191220191020363925",
                        "ResponseCode": "0",
                        "ResponseDescription": "Success. Request accepted for processing",
                        "CustomerMessage": "Success. Request accepted for processing"
                    }))
                }),
            );
        let base = mock::serve(app).await;

        let reference = provider(base)
            .initiate(5000, "255755123456", "abcdefghijklmnop")
            .await
            .unwrap();
        assert_eq!(reference, "ws_CO_191220191020363925");
    }

    #[tokio::test]
    async fn token_failure_is_auth_failed() {
        let app = Router::new().route(
            "/oauth/v1/generate",
            get(|| async { (StatusCode::UNAUTHORIZED, "bad credentials") }),
        );
        let base = mock::serve(app).await;

        let err = provider(base)
            .initiate(100, "255755123456", "ref")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::AuthFailed { provider: PaymentMethod::Mpesa, .. }));
    }

    #[tokio::test]
    async fn token_without_access_token_is_auth_failed() {
        let app = Router::new().route(
            "/oauth/v1/generate",
            get(|| async { Json(json!({ "expires_in": "3599" })) }),
        );
        let base = mock::serve(app).await;

        let err = provider(base)
            .initiate(100, "255755123456", "ref")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn provider_error_body_is_request_rejected() {
        let app = Router::new()
            .route("/oauth/v1/generate", get(token))
            .route(
                "/mpesa/stkpush/v1/processrequest",
                post(|| async {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({
                            "requestId": "1234-5678",
                            "errorCode": "400.002.02",
                            "errorMessage": "Bad Request - Invalid PhoneNumber"
                        })),
                    )
                }),
            );
        let base = mock::serve(app).await;

        let err = provider(base)
            .initiate(100, "12", "ref")
            .await
            .unwrap_err();
        match err {
            AdapterError::RequestRejected { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("400.002.02"));
                assert!(message.contains("Invalid PhoneNumber"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_provider_is_transport_error() {
        // Nothing listens on port 9 locally.
        let err = provider("http://127.0.0.1:9".to_string())
            .initiate(100, "255755123456", "ref")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Transport { .. }));
    }
}
