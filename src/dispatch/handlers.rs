//! Default business-action handlers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::{ActionHandler, ActionOutcome};
use crate::error::HandlerError;
use crate::guarantee::{Amendment, Guarantee, GuaranteeStatus, GuaranteeStore};
use crate::message::{Message, MessageKind, ParsedFields};
use crate::refs::ReferenceGenerator;
use crate::validate::{parse_swift_date, split_currency_amount};

/// Default handlers for all six supported kinds.
pub fn default_handlers(
    guarantees: Arc<dyn GuaranteeStore>,
    refs: Arc<dyn ReferenceGenerator>,
) -> Vec<Arc<dyn ActionHandler>> {
    vec![
        Arc::new(ReceivedGuaranteeHandler {
            guarantees: guarantees.clone(),
            refs: refs.clone(),
        }),
        Arc::new(AmendmentHandler {
            guarantees,
            refs,
        }),
        Arc::new(AuditNoteHandler {
            kind: MessageKind::Acknowledgement,
        }),
        Arc::new(AuditNoteHandler {
            kind: MessageKind::AmendmentConfirmation,
        }),
        Arc::new(AuditNoteHandler {
            kind: MessageKind::DiscrepancyAdvice,
        }),
        Arc::new(AuditNoteHandler {
            kind: MessageKind::FreeFormat,
        }),
    ]
}

// ── Received guarantee ──────────────────────────────────────────────

/// Creates a guarantee aggregate in the `Received` sub-status and links
/// it to the message.
pub struct ReceivedGuaranteeHandler {
    guarantees: Arc<dyn GuaranteeStore>,
    refs: Arc<dyn ReferenceGenerator>,
}

#[async_trait]
impl ActionHandler for ReceivedGuaranteeHandler {
    fn kind(&self) -> MessageKind {
        MessageKind::ReceivedGuarantee
    }

    async fn process(
        &self,
        message: &Message,
        fields: &ParsedFields,
    ) -> Result<ActionOutcome, HandlerError> {
        let ParsedFields::ReceivedGuarantee(fields) = fields else {
            return Err(HandlerError::FieldsMismatch { kind: self.kind() });
        };

        // Re-delivery: the aggregate may already exist for this message.
        if let Some(existing) = self.guarantees.find_by_source_message(message.id).await? {
            debug!(
                message_id = %message.id,
                guarantee = %existing.reference,
                "Guarantee already created for message, returning existing link"
            );
            return Ok(ActionOutcome {
                guarantee_id: Some(existing.id),
                amendment_id: None,
                note: None,
            });
        }

        // Validation guarantees these decompose; a mismatch here means
        // the fields were tampered with between stages.
        let (currency, amount) = split_currency_amount(&fields.currency_amount)
            .map_err(|_| HandlerError::FieldsMismatch { kind: self.kind() })?;
        let issue_date = parse_swift_date(&fields.issue_date)
            .map_err(|_| HandlerError::FieldsMismatch { kind: self.kind() })?;
        let expiry_date = parse_swift_date(&fields.expiry_date)
            .map_err(|_| HandlerError::FieldsMismatch { kind: self.kind() })?;

        let now = Utc::now();
        let guarantee = Guarantee {
            id: Uuid::new_v4(),
            reference: self.refs.next("GTR"),
            status: GuaranteeStatus::Received,
            currency,
            amount,
            issue_date,
            expiry_date,
            applicant: fields.applicant.clone(),
            beneficiary: fields.beneficiary.clone(),
            details: fields.details.clone(),
            counterparty_reference: message.sender_reference.clone(),
            source_message_id: message.id,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let reference = guarantee.reference.clone();
        let guarantee_id = guarantee.id;
        let currency = guarantee.currency.clone();
        let amount = guarantee.amount;
        self.guarantees.create(guarantee).await?;

        info!(
            message_id = %message.id,
            guarantee = %reference,
            currency = %currency,
            amount = %amount,
            "Guarantee created from received message"
        );

        Ok(ActionOutcome {
            guarantee_id: Some(guarantee_id),
            amendment_id: None,
            note: Some(format!("guarantee {reference} created")),
        })
    }
}

// ── Amendment ───────────────────────────────────────────────────────

/// Resolves the target guarantee via the correlation reference and
/// records a linked amendment.
pub struct AmendmentHandler {
    guarantees: Arc<dyn GuaranteeStore>,
    refs: Arc<dyn ReferenceGenerator>,
}

#[async_trait]
impl ActionHandler for AmendmentHandler {
    fn kind(&self) -> MessageKind {
        MessageKind::Amendment
    }

    async fn process(
        &self,
        message: &Message,
        fields: &ParsedFields,
    ) -> Result<ActionOutcome, HandlerError> {
        let ParsedFields::Amendment(fields) = fields else {
            return Err(HandlerError::FieldsMismatch { kind: self.kind() });
        };

        // Re-delivery: the amendment may already be recorded.
        if let Some(existing) = self
            .guarantees
            .find_amendment_by_source_message(message.id)
            .await?
        {
            debug!(
                message_id = %message.id,
                amendment = %existing.reference,
                "Amendment already recorded for message, returning existing link"
            );
            return Ok(ActionOutcome {
                guarantee_id: Some(existing.guarantee_id),
                amendment_id: Some(existing.id),
                note: None,
            });
        }

        let correlation = message
            .transaction_reference
            .clone()
            .ok_or(HandlerError::MissingCorrelation)?;
        let guarantee = self
            .guarantees
            .find_by_reference(&correlation)
            .await?
            .ok_or(HandlerError::RelatedGuaranteeNotFound {
                reference: correlation.clone(),
            })?;

        let (new_currency, new_amount) = match &fields.new_currency_amount {
            Some(composite) => {
                let (currency, amount) = split_currency_amount(composite)
                    .map_err(|_| HandlerError::FieldsMismatch { kind: self.kind() })?;
                (Some(currency), Some(amount))
            }
            None => (None, None),
        };
        let new_expiry_date = fields
            .new_expiry_date
            .as_deref()
            .map(parse_swift_date)
            .transpose()
            .map_err(|_| HandlerError::FieldsMismatch { kind: self.kind() })?;

        let amendment = Amendment {
            id: Uuid::new_v4(),
            reference: self.refs.next("AMD"),
            guarantee_id: guarantee.id,
            narrative: fields.narrative.clone(),
            new_currency,
            new_amount,
            new_expiry_date,
            source_message_id: message.id,
            created_at: Utc::now(),
        };
        let reference = amendment.reference.clone();
        let amendment_id = amendment.id;

        // Optimistic check: a concurrent writer bumps the version and we
        // fail transiently; the retry re-reads and succeeds.
        self.guarantees
            .record_amendment(guarantee.id, guarantee.version, amendment)
            .await?;

        info!(
            message_id = %message.id,
            amendment = %reference,
            guarantee = %guarantee.reference,
            "Amendment recorded"
        );

        Ok(ActionOutcome {
            guarantee_id: Some(guarantee.id),
            amendment_id: Some(amendment_id),
            note: Some(format!(
                "amendment {reference} recorded against guarantee {}",
                guarantee.reference
            )),
        })
    }
}

// ── Audit-only kinds ────────────────────────────────────────────────

/// Handler for kinds whose processing records an audit note and mutates
/// no aggregate (the reference behaviour for acknowledgements,
/// confirmations, discrepancy advices and free-format messages).
pub struct AuditNoteHandler {
    kind: MessageKind,
}

#[async_trait]
impl ActionHandler for AuditNoteHandler {
    fn kind(&self) -> MessageKind {
        self.kind
    }

    async fn process(
        &self,
        message: &Message,
        fields: &ParsedFields,
    ) -> Result<ActionOutcome, HandlerError> {
        if fields.kind() != self.kind {
            return Err(HandlerError::FieldsMismatch { kind: self.kind });
        }
        let correlation = message
            .transaction_reference
            .as_deref()
            .unwrap_or("none");
        Ok(ActionOutcome {
            guarantee_id: None,
            amendment_id: None,
            note: Some(format!(
                "{} recorded (correlation {correlation}); no aggregate action",
                self.kind.display_name()
            )),
        })
    }
}
