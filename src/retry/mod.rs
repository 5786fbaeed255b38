//! Retry and failure recovery.
//!
//! The policy is an explicit value object and every operation takes
//! `now` from the caller, so tests drive the clock instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::{AlertKind, AlertSink, OperationalAlert};
use crate::config::EngineConfig;
use crate::error::{EngineError, Error, StoreError};
use crate::message::{Message, MessageStatus};
use crate::store::MessageStore;

/// Retry behaviour constants.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Budget granted to every ingested message.
    pub max_retries: u32,
    /// Fixed delay before a failed message becomes retry-eligible.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(300),
        }
    }
}

/// Tracks retry eligibility, schedules re-attempts, and permanently
/// exhausts messages that exceed their budget.
pub struct RetryCoordinator {
    store: Arc<dyn MessageStore>,
    alerts: Arc<dyn AlertSink>,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        alerts: Arc<dyn AlertSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            alerts,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failure for a message already transitioned into its
    /// error state: bump the retry count and either schedule the next
    /// attempt or exhaust the budget and alert.
    ///
    /// Permanent-business failures alert on first occurrence so a human
    /// can remediate while the (possibly pointless) retries tick down.
    pub async fn record_failure(
        &self,
        message: &Message,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let retry_count = message.retry_count + 1;
        let exhausted = retry_count >= message.max_retries;
        let next_retry_at = if exhausted {
            None
        } else {
            Some(now + chrono::Duration::from_std(self.policy.delay).unwrap_or_default())
        };

        self.store
            .set_retry_state(message.id, retry_count, next_retry_at, now)
            .await?;

        let diagnostic = message.error.as_deref().unwrap_or("unknown failure");
        if permanent && retry_count == 1 {
            self.alerts
                .alert(OperationalAlert {
                    kind: AlertKind::PermanentFailure,
                    message_id: message.id,
                    reference: message.reference.clone(),
                    message_kind: message.kind,
                    detail: diagnostic.to_string(),
                })
                .await;
        }

        if exhausted {
            warn!(
                message_id = %message.id,
                reference = %message.reference,
                retry_count,
                "Retry budget exhausted"
            );
            self.alerts
                .alert(OperationalAlert {
                    kind: AlertKind::RetriesExhausted,
                    message_id: message.id,
                    reference: message.reference.clone(),
                    message_kind: message.kind,
                    detail: format!(
                        "{} after {retry_count} attempts: {diagnostic}",
                        if permanent {
                            "needs manual remediation"
                        } else {
                            "needs manual reprocessing"
                        }
                    ),
                })
                .await;
        } else {
            info!(
                message_id = %message.id,
                reference = %message.reference,
                retry_count,
                next_retry_at = ?next_retry_at,
                "Retry scheduled"
            );
        }
        Ok(())
    }

    /// Messages the periodic scan should hand to the workers at `now`.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Message>, Error> {
        Ok(self.store.due_for_processing(now).await?)
    }

    /// Resubmit a retry-eligible error message into RECEIVED.
    pub async fn resubmit(&self, message: &Message, now: DateTime<Utc>) -> Result<Message, Error> {
        if !message.status.is_error() {
            return Err(EngineError::NotRetryable {
                id: message.id,
                status: message.status,
            }
            .into());
        }
        let resubmitted = self
            .store
            .transition(message.id, message.status, MessageStatus::Received, now)
            .await?;
        info!(
            message_id = %message.id,
            reference = %message.reference,
            retry_count = message.retry_count,
            "Message resubmitted for retry"
        );
        Ok(resubmitted)
    }

    /// Manual reset into RECEIVED with a fresh budget — the operator's
    /// escape hatch for exhausted messages. REJECTED and ARCHIVED
    /// messages stay where they are.
    pub async fn manual_retry(&self, id: Uuid, now: DateTime<Utc>) -> Result<Message, Error> {
        let message = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::NotFound { id })?;
        if !message.status.is_error() {
            return Err(EngineError::NotRetryable {
                id,
                status: message.status,
            }
            .into());
        }
        self.store.set_retry_state(id, 0, None, now).await?;
        let resubmitted = self
            .store
            .transition(id, message.status, MessageStatus::Received, now)
            .await?;
        self.store
            .append_note(id, "manual retry: budget reset by operator", now)
            .await?;
        info!(message_id = %id, reference = %message.reference, "Manual retry");
        Ok(resubmitted)
    }
}
