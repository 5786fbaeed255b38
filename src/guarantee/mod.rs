//! Guarantee and amendment aggregates.
//!
//! Real persistence for these lives outside the engine; the trait is
//! the collaborator seam and the in-memory implementation backs tests
//! and single-process deployments. Amendment recording uses optimistic
//! versioning so two messages touching the same guarantee cannot
//! silently overwrite each other.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AggregateError;

/// Sub-status of a guarantee aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuaranteeStatus {
    /// Created from an inbound received-guarantee message.
    Received,
    /// At least one amendment has been recorded.
    Amended,
}

/// A guarantee received from a counterparty bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guarantee {
    pub id: Uuid,
    /// Our generated business reference.
    pub reference: String,
    pub status: GuaranteeStatus,
    pub currency: String,
    pub amount: Decimal,
    pub issue_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub applicant: String,
    pub beneficiary: String,
    pub details: Option<String>,
    /// The issuing bank's own reference — what amendments correlate on.
    pub counterparty_reference: Option<String>,
    /// The message that created this aggregate.
    pub source_message_id: Uuid,
    /// Optimistic concurrency version, bumped on every mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An amendment recorded against a guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amendment {
    pub id: Uuid,
    /// Our generated business reference.
    pub reference: String,
    pub guarantee_id: Uuid,
    pub narrative: String,
    pub new_currency: Option<String>,
    pub new_amount: Option<Decimal>,
    pub new_expiry_date: Option<NaiveDate>,
    /// The message that produced this amendment.
    pub source_message_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Aggregate store consumed by the business-action handlers.
#[async_trait]
pub trait GuaranteeStore: Send + Sync {
    /// Persist a new guarantee. Fails on a duplicate business reference.
    async fn create(&self, guarantee: Guarantee) -> Result<(), AggregateError>;

    async fn get(&self, id: Uuid) -> Result<Option<Guarantee>, AggregateError>;

    /// Resolve a guarantee by correlation reference — either our
    /// business reference or the counterparty's.
    async fn find_by_reference(&self, reference: &str) -> Result<Option<Guarantee>, AggregateError>;

    /// The guarantee created by a given source message, if any.
    async fn find_by_source_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<Guarantee>, AggregateError>;

    /// Record an amendment with an optimistic version check. Applies
    /// any amount/expiry change, marks the guarantee amended, and bumps
    /// its version.
    async fn record_amendment(
        &self,
        guarantee_id: Uuid,
        expected_version: u64,
        amendment: Amendment,
    ) -> Result<(), AggregateError>;

    /// The amendment produced by a given source message, if any.
    async fn find_amendment_by_source_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<Amendment>, AggregateError>;

    /// All amendments recorded against a guarantee, oldest first.
    async fn amendments_for(&self, guarantee_id: Uuid) -> Result<Vec<Amendment>, AggregateError>;
}

// ── In-memory implementation ────────────────────────────────────────

#[derive(Default)]
struct Inner {
    guarantees: HashMap<Uuid, Guarantee>,
    amendments: HashMap<Uuid, Amendment>,
}

/// Aggregate store backed by in-process maps.
#[derive(Default)]
pub struct MemoryGuaranteeStore {
    inner: RwLock<Inner>,
}

impl MemoryGuaranteeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GuaranteeStore for MemoryGuaranteeStore {
    async fn create(&self, guarantee: Guarantee) -> Result<(), AggregateError> {
        let mut inner = self.inner.write().await;
        if inner
            .guarantees
            .values()
            .any(|g| g.reference == guarantee.reference)
        {
            return Err(AggregateError::DuplicateReference {
                reference: guarantee.reference,
            });
        }
        inner.guarantees.insert(guarantee.id, guarantee);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Guarantee>, AggregateError> {
        Ok(self.inner.read().await.guarantees.get(&id).cloned())
    }

    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Guarantee>, AggregateError> {
        let inner = self.inner.read().await;
        Ok(inner
            .guarantees
            .values()
            .find(|g| {
                g.reference == reference
                    || g.counterparty_reference.as_deref() == Some(reference)
            })
            .cloned())
    }

    async fn find_by_source_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<Guarantee>, AggregateError> {
        let inner = self.inner.read().await;
        Ok(inner
            .guarantees
            .values()
            .find(|g| g.source_message_id == message_id)
            .cloned())
    }

    async fn record_amendment(
        &self,
        guarantee_id: Uuid,
        expected_version: u64,
        amendment: Amendment,
    ) -> Result<(), AggregateError> {
        let mut inner = self.inner.write().await;
        let guarantee = inner.guarantees.get_mut(&guarantee_id).ok_or_else(|| {
            AggregateError::NotFound {
                reference: guarantee_id.to_string(),
            }
        })?;
        if guarantee.version != expected_version {
            return Err(AggregateError::VersionConflict {
                id: guarantee_id,
                expected: expected_version,
                actual: guarantee.version,
            });
        }

        if let (Some(currency), Some(amount)) = (&amendment.new_currency, amendment.new_amount) {
            guarantee.currency = currency.clone();
            guarantee.amount = amount;
        }
        if let Some(expiry) = amendment.new_expiry_date {
            guarantee.expiry_date = expiry;
        }
        guarantee.status = GuaranteeStatus::Amended;
        guarantee.version += 1;
        guarantee.updated_at = amendment.created_at;

        inner.amendments.insert(amendment.id, amendment);
        Ok(())
    }

    async fn find_amendment_by_source_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<Amendment>, AggregateError> {
        let inner = self.inner.read().await;
        Ok(inner
            .amendments
            .values()
            .find(|a| a.source_message_id == message_id)
            .cloned())
    }

    async fn amendments_for(&self, guarantee_id: Uuid) -> Result<Vec<Amendment>, AggregateError> {
        let inner = self.inner.read().await;
        let mut amendments: Vec<Amendment> = inner
            .amendments
            .values()
            .filter(|a| a.guarantee_id == guarantee_id)
            .cloned()
            .collect();
        amendments.sort_by_key(|a| a.created_at);
        Ok(amendments)
    }
}
