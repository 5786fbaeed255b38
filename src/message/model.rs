//! Message record and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::fields::ParsedFields;

// ── Message kind ────────────────────────────────────────────────────

/// Kind of a structured guarantee message.
///
/// Each kind carries a fixed textual code and display name. The code is
/// what appears on the wire and in drop-folder file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Guarantee issued in our favour by a counterparty bank (760).
    ReceivedGuarantee,
    /// Amendment to a previously received guarantee (767).
    Amendment,
    /// Acknowledgement of a guarantee message (768).
    Acknowledgement,
    /// Confirmation that an amendment was processed (769).
    AmendmentConfirmation,
    /// Advice of discrepancy (750).
    DiscrepancyAdvice,
    /// Free-format message (799).
    FreeFormat,
}

impl MessageKind {
    /// All supported kinds, in code order.
    pub const ALL: [MessageKind; 6] = [
        MessageKind::DiscrepancyAdvice,
        MessageKind::ReceivedGuarantee,
        MessageKind::Amendment,
        MessageKind::Acknowledgement,
        MessageKind::AmendmentConfirmation,
        MessageKind::FreeFormat,
    ];

    /// Fixed wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ReceivedGuarantee => "760",
            Self::Amendment => "767",
            Self::Acknowledgement => "768",
            Self::AmendmentConfirmation => "769",
            Self::DiscrepancyAdvice => "750",
            Self::FreeFormat => "799",
        }
    }

    /// Human-readable display name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ReceivedGuarantee => "Received Guarantee",
            Self::Amendment => "Guarantee Amendment",
            Self::Acknowledgement => "Acknowledgement",
            Self::AmendmentConfirmation => "Amendment Processing Confirmation",
            Self::DiscrepancyAdvice => "Discrepancy Advice",
            Self::FreeFormat => "Free Format Message",
        }
    }

    /// Resolve a kind from its wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    /// The kind of the automatic response this kind requires, if any.
    pub fn response_kind(&self) -> Option<MessageKind> {
        match self {
            Self::ReceivedGuarantee => Some(Self::Acknowledgement),
            Self::Amendment => Some(Self::AmendmentConfirmation),
            _ => None,
        }
    }

    /// Whether processing this kind must end with a generated response.
    pub fn requires_response(&self) -> bool {
        self.response_kind().is_some()
    }

    /// Default processing priority (lower is more urgent).
    pub fn default_priority(&self) -> u8 {
        match self {
            Self::ReceivedGuarantee => 1,
            Self::Amendment => 2,
            Self::DiscrepancyAdvice => 3,
            Self::Acknowledgement | Self::AmendmentConfirmation => 4,
            Self::FreeFormat => 5,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ── Message status ──────────────────────────────────────────────────

/// Status of a message in the processing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Persisted, awaiting processing.
    Received,
    /// Picked up by a worker.
    Processing,
    /// Raw text parsed into typed fields.
    Parsed,
    /// Business rules passed.
    Validated,
    /// Business action applied.
    Processed,
    /// Response message generated and linked.
    Responded,
    /// Grammar mismatch during parsing.
    ParseError,
    /// Business-rule violations.
    ValidationError,
    /// Business-action handler failed.
    ProcessingError,
    /// Explicit business-policy rejection. Terminal.
    Rejected,
    /// Housekept in place. Terminal.
    Archived,
}

impl MessageStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: MessageStatus) -> bool {
        use MessageStatus::*;

        matches!(
            (self, target),
            // Happy path
            (Received, Processing) |
            (Processing, Parsed) | (Processing, ParseError) |
            (Parsed, Validated) | (Parsed, ValidationError) |
            (Validated, Processed) | (Validated, ProcessingError) |
            (Processed, Responded) |
            // Retry resubmission
            (ParseError, Received) | (ValidationError, Received) | (ProcessingError, Received) |
            // Explicit policy rejection
            (Received, Rejected) | (ParseError, Rejected) |
            (ValidationError, Rejected) | (ProcessingError, Rejected) |
            // Housekeeping
            (Processed, Archived) | (Responded, Archived) | (Rejected, Archived) |
            (ParseError, Archived) | (ValidationError, Archived) | (ProcessingError, Archived)
        )
    }

    /// Whether this is one of the three retryable error statuses.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ParseError | Self::ValidationError | Self::ProcessingError
        )
    }

    /// Whether processing completed successfully.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Processed | Self::Responded)
    }

    /// Whether no further transition is possible, even manually.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Archived)
    }

    /// Mid-pipeline statuses a crashed worker can leave behind.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Processing | Self::Parsed | Self::Validated)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Parsed => "parsed",
            Self::Validated => "validated",
            Self::Processed => "processed",
            Self::Responded => "responded",
            Self::ParseError => "parse_error",
            Self::ValidationError => "validation_error",
            Self::ProcessingError => "processing_error",
            Self::Rejected => "rejected",
            Self::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

// ── Message record ──────────────────────────────────────────────────

/// A persisted inbound or outbound message.
///
/// Mutated exclusively through the store's compare-and-set transition
/// plus targeted field updates; never deleted. Terminal messages are
/// archived in place, preserving the full audit history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Store identity.
    pub id: Uuid,
    /// Engine reference — globally unique, assigned at ingestion.
    pub reference: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    /// Raw payload text as received.
    pub raw: String,
    /// Typed field map, present once parsing succeeded.
    pub fields: Option<ParsedFields>,
    /// Sending institution, derived by the parser.
    pub sender: Option<String>,
    /// Receiving institution, derived by the parser.
    pub receiver: Option<String>,
    /// The counterparty's own reference (:20:).
    pub sender_reference: Option<String>,
    /// Correlation reference (:21:) locating the related aggregate.
    pub transaction_reference: Option<String>,
    /// Ordering within a correlated exchange (:27:).
    pub sequence: u32,
    /// Lower is more urgent. Defaults per kind.
    pub priority: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    /// When the message next becomes retry-eligible. None once the
    /// budget is exhausted or while the message is healthy.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_ended_at: Option<DateTime<Utc>>,
    /// Diagnostic text for the most recent failure.
    pub error: Option<String>,
    /// Original message, set on generated responses.
    pub parent_id: Option<Uuid>,
    /// Generated response, set back on the original.
    pub response_id: Option<Uuid>,
    /// Guarantee aggregate this message produced or touched.
    pub guarantee_id: Option<Uuid>,
    /// Amendment record this message produced.
    pub amendment_id: Option<Uuid>,
    /// Append-only audit notes.
    pub notes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Create a freshly ingested inbound message at RECEIVED.
    pub fn inbound(
        reference: impl Into<String>,
        kind: MessageKind,
        raw: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference: reference.into(),
            kind,
            status: MessageStatus::Received,
            raw: raw.into(),
            fields: None,
            sender: None,
            receiver: None,
            sender_reference: None,
            transaction_reference: None,
            sequence: 1,
            priority: kind.default_priority(),
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            received_at: now,
            processing_started_at: None,
            processing_ended_at: None,
            error: None,
            parent_id: None,
            response_id: None,
            guarantee_id: None,
            amendment_id: None,
            notes: Vec::new(),
            updated_at: now,
        }
    }

    /// Create a generated response to `original`, persisted at PROCESSED.
    ///
    /// Sender and receiver are swapped from the original; the original's
    /// engine reference becomes the correlation reference.
    pub fn response(
        reference: impl Into<String>,
        kind: MessageKind,
        raw: impl Into<String>,
        original: &Message,
        now: DateTime<Utc>,
    ) -> Self {
        let mut msg = Self::inbound(reference, kind, raw, original.max_retries, now);
        msg.status = MessageStatus::Processed;
        msg.parent_id = Some(original.id);
        msg.sender = original.receiver.clone();
        msg.receiver = original.sender.clone();
        msg.sender_reference = Some(msg.reference.clone());
        msg.transaction_reference = Some(original.reference.clone());
        msg.processing_ended_at = Some(now);
        msg
    }

    /// Apply a status change and its timestamp side effects.
    ///
    /// Edge legality is the store's job; this only records the change.
    pub fn apply_status(&mut self, to: MessageStatus, now: DateTime<Utc>) {
        match to {
            MessageStatus::Processing => {
                self.processing_started_at = Some(now);
                self.processing_ended_at = None;
            }
            MessageStatus::Received => {
                // Resubmission for retry: the message is healthy again.
                self.next_retry_at = None;
            }
            MessageStatus::Processed
            | MessageStatus::ParseError
            | MessageStatus::ValidationError
            | MessageStatus::ProcessingError => {
                self.processing_ended_at = Some(now);
            }
            _ => {}
        }
        self.status = to;
        self.updated_at = now;
    }

    /// Whether the retry budget is used up.
    pub fn retry_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Whether the automatic scan may resubmit this message at `now`.
    pub fn retry_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_error()
            && !self.retry_exhausted()
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}
