//! Application configuration loaded from environment variables.
//!
//! Provider credentials are optional. A provider whose credential pair is
//! missing (or blank) is served by the simulated adapter instead.

use std::time::Duration;

use crate::errors::{PaymentError, Result};

const DEFAULT_MPESA_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const DEFAULT_MPESA_SHORTCODE: &str = "174379";
/// Public Daraja sandbox passkey for shortcode 174379.
const DEFAULT_MPESA_PASSKEY: &str =
    "bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c919";
const DEFAULT_AIRTEL_BASE_URL: &str = "https://openapiuat.airtel.africa";
const DEFAULT_SELCOM_BASE_URL: &str = "https://apigw.selcommobile.com";

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Business shortcode (paybill / till).
    pub shortcode: String,
    pub passkey: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct AirtelConfig {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    /// ISO country sent in `X-Country` and the subscriber block.
    pub country: String,
    pub currency: String,
    pub x_key: Option<String>,
    pub x_signature: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SelcomConfig {
    pub api_key: String,
    pub api_secret: String,
    pub vendor: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Public base URL providers call back into (e.g. https://pay.example.org)
    pub callback_base_url: String,
    /// Dialling prefix used when normalizing phone numbers (no `+`)
    pub phone_country_code: String,
    /// Request deadline for every outbound provider call
    pub provider_timeout_secs: u64,
    /// Delay before a simulated payment auto-completes
    pub simulated_settle_secs: u64,
    pub mpesa: Option<MpesaConfig>,
    pub airtel: Option<AirtelConfig>,
    pub selcom: Option<SelcomConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let api_port: u16 = parse(&or("API_PORT", "3001"), "API_PORT")?;

        let mpesa = match (var("MPESA_CONSUMER_KEY"), var("MPESA_CONSUMER_SECRET")) {
            (Some(consumer_key), Some(consumer_secret)) => Some(MpesaConfig {
                consumer_key,
                consumer_secret,
                shortcode: or("MPESA_SHORTCODE", DEFAULT_MPESA_SHORTCODE),
                passkey: or("MPESA_PASSKEY", DEFAULT_MPESA_PASSKEY),
                base_url: or("MPESA_BASE_URL", DEFAULT_MPESA_BASE_URL),
            }),
            _ => None,
        };

        let airtel = match (var("AIRTEL_MONEY_API_KEY"), var("AIRTEL_MONEY_API_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(AirtelConfig {
                client_id,
                client_secret,
                base_url: or("AIRTEL_BASE_URL", DEFAULT_AIRTEL_BASE_URL),
                country: or("AIRTEL_COUNTRY", "TZ"),
                currency: or("AIRTEL_CURRENCY", "TZS"),
                x_key: var("AIRTEL_X_KEY"),
                x_signature: var("AIRTEL_X_SIGNATURE"),
            }),
            _ => None,
        };

        let selcom = match (var("SELCOM_API_KEY"), var("SELCOM_API_SECRET")) {
            (Some(api_key), Some(api_secret)) => Some(SelcomConfig {
                api_key,
                api_secret,
                vendor: or("SELCOM_VENDOR", "TILL61103867"),
                base_url: or("SELCOM_BASE_URL", DEFAULT_SELCOM_BASE_URL),
            }),
            _ => None,
        };

        let phone_country_code = or("PHONE_COUNTRY_CODE", "255");
        if !phone_country_code.chars().all(|c| c.is_ascii_digit()) {
            return Err(PaymentError::Config(
                "PHONE_COUNTRY_CODE must contain digits only".to_string(),
            ));
        }

        Ok(Config {
            database_url: or("DATABASE_URL", "sqlite:./contributions.db"),
            api_port,
            callback_base_url: or("CALLBACK_BASE_URL", &format!("http://localhost:{api_port}"))
                .trim_end_matches('/')
                .to_string(),
            phone_country_code,
            provider_timeout_secs: parse(
                &or("PROVIDER_TIMEOUT_SECS", "30"),
                "PROVIDER_TIMEOUT_SECS",
            )?,
            simulated_settle_secs: parse(
                &or("SIMULATED_SETTLE_SECS", "5"),
                "SIMULATED_SETTLE_SECS",
            )?,
            mpesa,
            airtel,
            selcom,
        })
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn simulated_settle_delay(&self) -> Duration {
        Duration::from_secs(self.simulated_settle_secs)
    }

    /// URL a provider should POST its callback to, e.g. `<base>/mpesa-callback`.
    pub fn callback_url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.callback_base_url)
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PaymentError::Config(format!("Invalid {key}")))
}
