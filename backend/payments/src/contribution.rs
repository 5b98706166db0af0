//! Contribution record and its lifecycle.
//!
//! A contribution moves strictly forward:
//!
//! ```text
//! Pending ──► Processing ──► Completed
//!    │             └───────► Failed
//!    └──────────────────────► Failed
//! ```
//!
//! `Completed` is only reachable once a provider has accepted the request.
//! `Completed` and `Failed` are terminal. Every write to the store is checked
//! with [`ContributionStatus::can_transition_to`] before it is applied.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mobile-money network used to collect a contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// Vodacom / Safaricom M-Pesa STK push.
    Mpesa,
    /// Airtel Money collection.
    Airtel,
    /// Selcom wallet push.
    Selcom,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 3] = [Self::Mpesa, Self::Airtel, Self::Selcom];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mpesa => "mpesa",
            Self::Airtel => "airtel",
            Self::Selcom => "selcom",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mpesa" | "m-pesa" => Ok(Self::Mpesa),
            "airtel" => Ok(Self::Airtel),
            "selcom" => Ok(Self::Selcom),
            other => Err(format!("unknown payment method '{other}'")),
        }
    }
}

/// Lifecycle status of a contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ContributionStatus {
    /// Record created, provider not yet contacted.
    Pending,
    /// Provider accepted the request; waiting for the customer.
    Processing,
    /// Provider confirmed the payment.
    Completed,
    /// Provider declined, the customer cancelled, or initiation failed.
    Failed,
}

impl ContributionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Only forward moves out of a non-terminal status are allowed, and a
    /// record must be `Processing` before it can complete.
    pub fn can_transition_to(&self, next: ContributionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Failed)
                | (Self::Processing, Self::Completed | Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ContributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for a new record. The store assigns `id`, `status` and `timestamp`.
#[derive(Debug, Clone)]
pub struct NewContribution {
    pub contributor_name: String,
    pub amount: i64,
    pub phone_number: String,
    pub payment_method: PaymentMethod,
    pub purpose: Option<String>,
}

/// A contribution as stored in / read from the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contribution {
    pub id: String,
    pub contributor_name: String,
    pub amount: i64,
    pub phone_number: String,
    pub payment_method: PaymentMethod,
    pub purpose: Option<String>,
    pub status: ContributionStatus,
    pub external_reference: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Contribution {
    /// Build a fresh `pending` record with a new random id.
    pub fn new_pending(new: NewContribution) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            contributor_name: new.contributor_name,
            amount: new.amount,
            phone_number: new.phone_number,
            payment_method: new.payment_method,
            purpose: new.purpose,
            status: ContributionStatus::Pending,
            external_reference: None,
            timestamp: Utc::now(),
        }
    }
}

/// Read-only view served by `check-payment-status` and consumed by the poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub id: String,
    pub status: ContributionStatus,
    pub amount: i64,
    pub contributor_name: String,
    pub timestamp: DateTime<Utc>,
}

impl From<Contribution> for StatusSnapshot {
    fn from(c: Contribution) -> Self {
        Self {
            id: c.id,
            status: c.status,
            amount: c.amount,
            contributor_name: c.contributor_name,
            timestamp: c.timestamp,
        }
    }
}
