//! Airtel Money collections (merchant v2).
//!
//! A client-credentials token from `/auth/oauth2/token` authorizes the
//! `/merchant/v2/payments/` push. The correlation reference is sent as the
//! transaction id, and Airtel echoes `transaction.id` in its callback.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{transport, PaymentProvider};
use crate::config::AirtelConfig;
use crate::contribution::PaymentMethod;
use crate::errors::AdapterError;

const PROVIDER: PaymentMethod = PaymentMethod::Airtel;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PaymentResponse {
    #[serde(default)]
    data: Option<PaymentData>,
    #[serde(default)]
    status: Option<ResponseStatus>,
}

#[derive(Debug, Deserialize)]
struct PaymentData {
    transaction: Option<TransactionData>,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseStatus {
    code: Option<String>,
    message: Option<String>,
    response_code: Option<String>,
    success: Option<bool>,
}

pub struct AirtelProvider {
    client: Client,
    config: AirtelConfig,
}

impl AirtelProvider {
    pub fn new(client: Client, config: AirtelConfig) -> Self {
        Self { client, config }
    }

    async fn access_token(&self) -> Result<String, AdapterError> {
        let resp = self
            .client
            .post(format!("{}/auth/oauth2/token", self.config.base_url))
            .json(&json!({
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
                "grant_type": "client_credentials",
            }))
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

#[async_trait]
impl PaymentProvider for AirtelProvider {
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
        let cfg = &self.config;

        let mut request = self
            .client
            .post(format!("{}/merchant/v2/payments/", cfg.base_url))
            .header("Accept", "*/*")
            .header("X-Country", &cfg.country)
            .header("X-Currency", &cfg.currency)
            .bearer_auth(token)
            .json(&json!({
                "reference": correlation_ref,
                "subscriber": {
                    "country": cfg.country,
                    "currency": cfg.currency,
                    "msisdn": phone,
                },
                "transaction": {
                    "amount": amount,
                    "country": cfg.country,
                    "currency": cfg.currency,
                    "id": correlation_ref,
                },
            }));
        if let Some(signature) = &cfg.x_signature {
            request = request.header("x-signature", signature);
        }
        if let Some(key) = &cfg.x_key {
            request = request.header("x-key", key);
        }

        let resp = request.send().await.map_err(transport(PROVIDER))?;
        let status = resp.status();
        // Error bodies are not always JSON; an empty shape keeps the status check below.
        let body: PaymentResponse = resp.json().await.unwrap_or_default();
        debug!("Airtel Money payment response: {body:?}");

        let declined = body
            .status
            .as_ref()
            .and_then(|s| s.success)
            .is_some_and(|ok| !ok);
        if !status.is_success() || declined {
            let (code, message) = match body.status {
                Some(s) => (
                    s.response_code.or(s.code),
                    s.message.unwrap_or_else(|| "payment request declined".to_string()),
                ),
                None => (
                    Some(status.as_str().to_string()),
                    format!("payment endpoint returned {status}"),
                ),
            };
            return Err(AdapterError::RequestRejected {
                provider: PROVIDER,
                code,
                message,
            });
        }

        let reference = body
            .data
            .and_then(|d| d.transaction)
            .and_then(|t| t.id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| correlation_ref.to_string());

        info!(correlation_ref, reference = %reference, "Airtel Money payment request accepted");
        Ok(reference)
    }
}
