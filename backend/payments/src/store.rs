//! Contribution store port.
//!
//! Every status write goes through [`ContributionStore::transition`], a
//! compare-and-set that only succeeds while the record is non-terminal and the
//! target is strictly later in the lifecycle. Implementations must make that
//! check and the write atomic per record.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::contribution::{Contribution, ContributionStatus, NewContribution};
use crate::errors::{PaymentError, Result};

pub type SharedStore = Arc<dyn ContributionStore>;

/// Result of a compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Write accepted; carries the updated record.
    Applied(Contribution),
    /// Guard rejected the write; carries the record as it stands.
    Stale(Contribution),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn contribution(&self) -> &Contribution {
        match self {
            Self::Applied(c) | Self::Stale(c) => c,
        }
    }
}

#[async_trait]
pub trait ContributionStore: Send + Sync {
    /// Insert a new `pending` record.
    async fn create(&self, new: NewContribution) -> Result<Contribution>;

    async fn get(&self, id: &str) -> Result<Option<Contribution>>;

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Contribution>>;

    /// Move `id` to `next`, optionally recording the external reference in the
    /// same write. Returns [`Transition::Stale`] when the guard fails and
    /// [`PaymentError::NotFound`] when the record does not exist.
    async fn transition(
        &self,
        id: &str,
        next: ContributionStatus,
        external_reference: Option<&str>,
    ) -> Result<Transition>;
}

/// Thread-safe in-memory store, used by tests and local fakes.
#[derive(Default, Clone)]
pub struct InMemoryContributionStore {
    records: Arc<RwLock<HashMap<String, Contribution>>>,
}

impl InMemoryContributionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ContributionStore for InMemoryContributionStore {
    async fn create(&self, new: NewContribution) -> Result<Contribution> {
        let contribution = Contribution::new_pending(new);
        let mut records = self.records.write().await;
        records.insert(contribution.id.clone(), contribution.clone());
        Ok(contribution)
    }

    async fn get(&self, id: &str) -> Result<Option<Contribution>> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Contribution>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|c| c.external_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn transition(
        &self,
        id: &str,
        next: ContributionStatus,
        external_reference: Option<&str>,
    ) -> Result<Transition> {
        // Held for the whole check-then-write.
        let mut records = self.records.write().await;

        if let Some(reference) = external_reference {
            let taken = records
                .values()
                .any(|c| c.id != id && c.external_reference.as_deref() == Some(reference));
            if taken {
                return Err(PaymentError::DuplicateReference(reference.to_string()));
            }
        }

        let record = records
            .get_mut(id)
            .ok_or_else(|| PaymentError::NotFound(id.to_string()))?;

        if !record.status.can_transition_to(next) {
            return Ok(Transition::Stale(record.clone()));
        }

        record.status = next;
        if let Some(reference) = external_reference {
            record.external_reference = Some(reference.to_string());
        }
        Ok(Transition::Applied(record.clone()))
    }
}
