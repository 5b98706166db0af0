//! Application-wide error types.

use thiserror::Error;

use crate::contribution::PaymentMethod;

/// Failures at the provider boundary. Adapters never retry; the caller decides.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{provider} authentication failed: {reason}")]
    AuthFailed {
        provider: PaymentMethod,
        reason: String,
    },

    #[error("{provider} rejected the request{}: {message}", code.as_deref().map(|c| format!(" (code {c})")).unwrap_or_default())]
    RequestRejected {
        provider: PaymentMethod,
        code: Option<String>,
        message: String,
    },

    #[error("No payment adapter registered for method: {0}")]
    UnsupportedMethod(String),

    #[error("{provider} transport error: {source}")]
    Transport {
        provider: PaymentMethod,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// The record for `contribution_id` has been moved to `failed` and kept.
    #[error("Payment initiation failed for contribution {contribution_id}: {source}")]
    InitiationFailed {
        contribution_id: String,
        #[source]
        source: AdapterError,
    },

    /// Adapter error raised before any record exists (e.g. no adapter registered).
    #[error("Payment adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("No contribution matches reference {0}")]
    UnknownReference(String),

    #[error("Contribution not found: {0}")]
    NotFound(String),

    #[error("External reference already in use: {0}")]
    DuplicateReference(String),

    /// The body is not JSON at all.
    #[error("Malformed {provider} callback: {reason}")]
    MalformedCallback {
        provider: PaymentMethod,
        reason: String,
    },

    /// Valid JSON that names no contribution we could match.
    #[error("Uncorrelated {provider} callback: {reason}")]
    UncorrelatedCallback {
        provider: PaymentMethod,
        reason: String,
    },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Status of contribution {contribution_id} still not terminal after {attempts} attempts")]
    PollTimeout {
        contribution_id: String,
        attempts: u32,
    },

    #[error("Status watch for contribution {0} was cancelled")]
    WatchCancelled(String),
}

pub type Result<T> = std::result::Result<T, PaymentError>;
