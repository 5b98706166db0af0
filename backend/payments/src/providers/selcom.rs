//! Selcom checkout: minimal order followed by a wallet push.
//!
//! Selcom has no token endpoint. Each request carries
//! `Authorization: SELCOM base64(api_key)` and an HMAC-SHA256 `Digest` over
//! `timestamp=<ts>&<field>=<value>…` for the fields named in `Signed-Fields`.
//! The order id is the correlation reference; Selcom echoes it as `order_id`
//! in the callback.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{FixedOffset, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::{debug, info};

use super::{transport, PaymentProvider};
use crate::config::SelcomConfig;
use crate::contribution::PaymentMethod;
use crate::errors::AdapterError;

const PROVIDER: PaymentMethod = PaymentMethod::Selcom;
const EAT_OFFSET_SECS: i32 = 3 * 3600;

#[derive(Debug, Default, Deserialize)]
struct SelcomResponse {
    resultcode: Option<String>,
    result: Option<String>,
    message: Option<String>,
}

pub struct SelcomProvider {
    client: Client,
    config: SelcomConfig,
    callback_url: String,
}

/// Headers for one signed request.
#[derive(Debug, PartialEq)]
pub(crate) struct SignedHeaders {
    pub authorization: String,
    pub timestamp: String,
    pub digest: String,
    pub signed_fields: String,
}

/// Sign `fields` in order. Values are rendered the way they appear in the body.
pub(crate) fn sign(
    api_key: &str,
    api_secret: &str,
    timestamp: &str,
    fields: &[(&str, Value)],
) -> Result<SignedHeaders, AdapterError> {
    let mut payload = format!("timestamp={timestamp}");
    for (name, value) in fields {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        payload.push_str(&format!("&{name}={rendered}"));
    }

    let mut mac =
        Hmac::<Sha256>::new_from_slice(api_secret.as_bytes()).map_err(|e| {
            AdapterError::AuthFailed {
                provider: PROVIDER,
                reason: format!("invalid API secret: {e}"),
            }
        })?;
    mac.update(payload.as_bytes());

    Ok(SignedHeaders {
        authorization: format!("SELCOM {}", STANDARD.encode(api_key)),
        timestamp: timestamp.to_string(),
        digest: STANDARD.encode(mac.finalize().into_bytes()),
        signed_fields: fields
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(","),
    })
}

fn selcom_timestamp() -> String {
    match FixedOffset::east_opt(EAT_OFFSET_SECS) {
        Some(eat) => Utc::now().with_timezone(&eat).to_rfc3339(),
        None => Utc::now().to_rfc3339(),
    }
}

impl SelcomProvider {
    pub fn new(client: Client, config: SelcomConfig, callback_url: String) -> Self {
        Self {
            client,
            config,
            callback_url,
        }
    }

    async fn signed_post(
        &self,
        path: &str,
        fields: Vec<(&str, Value)>,
    ) -> Result<SelcomResponse, AdapterError> {
        let headers = sign(
            &self.config.api_key,
            &self.config.api_secret,
            &selcom_timestamp(),
            &fields,
        )?;
        let body: Map<String, Value> = fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        let resp = self
            .client
            .post(format!("{}{path}", self.config.base_url))
            .header("Authorization", headers.authorization)
            .header("Timestamp", headers.timestamp)
            .header("Digest-Method", "HS256")
            .header("Digest", headers.digest)
            .header("Signed-Fields", headers.signed_fields)
            .json(&body)
            .send()
            .await
            .map_err(transport(PROVIDER))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AdapterError::AuthFailed {
                provider: PROVIDER,
                reason: format!("{path} returned {status}"),
            });
        }

        let body: SelcomResponse = resp.json().await.unwrap_or_default();
        debug!("Selcom {path} response: {body:?}");

        if !status.is_success() || body.resultcode.as_deref() != Some("000") {
            return Err(AdapterError::RequestRejected {
                provider: PROVIDER,
                code: body
                    .resultcode
                    .or_else(|| Some(status.as_str().to_string())),
                message: body
                    .message
                    .or(body.result)
                    .unwrap_or_else(|| format!("{path} returned {status}")),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl PaymentProvider for SelcomProvider {
    fn method(&self) -> PaymentMethod {
        PROVIDER
    }

    async fn initiate(
        &self,
        amount: i64,
        phone: &str,
        correlation_ref: &str,
    ) -> Result<String, AdapterError> {
        self.signed_post(
            "/v1/checkout/create-order-minimal",
            vec![
                ("vendor", Value::from(self.config.vendor.as_str())),
                ("order_id", Value::from(correlation_ref)),
                ("buyer_phone", Value::from(phone)),
                ("amount", Value::from(amount)),
                ("currency", Value::from("TZS")),
                ("webhook", Value::from(STANDARD.encode(&self.callback_url))),
                ("no_of_items", Value::from(1)),
            ],
        )
        .await?;

        self.signed_post(
            "/v1/checkout/wallet-payment",
            vec![
                ("transid", Value::from(correlation_ref)),
                ("order_id", Value::from(correlation_ref)),
                ("msisdn", Value::from(phone)),
            ],
        )
        .await?;

        info!(correlation_ref, "Selcom wallet push accepted");
        Ok(correlation_ref.to_string())
    }
}
