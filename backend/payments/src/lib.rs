//! Community contribution payments.
//!
//! Initiates mobile-money collections (M-Pesa, Airtel Money, Selcom),
//! reconciles provider callbacks into a monotonic contribution status, and
//! lets clients watch a contribution until it settles.

pub mod api;
pub mod config;
pub mod context;
pub mod contribution;
pub mod coordinator;
pub mod db;
pub mod errors;
pub mod poller;
pub mod providers;
pub mod reconciler;
pub mod store;
