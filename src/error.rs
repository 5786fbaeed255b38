//! Error types for the guaranty engine.

use uuid::Uuid;

use crate::message::{MessageKind, MessageStatus};

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Message-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Duplicate message reference: {reference}")]
    DuplicateReference { reference: String },

    #[error("Message not found: {id}")]
    NotFound { id: Uuid },

    #[error("Status conflict for message {id}: expected {expected}, found {actual}")]
    StatusConflict {
        id: Uuid,
        expected: MessageStatus,
        actual: MessageStatus,
    },

    #[error("Illegal transition for message {id}: {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("Message {id} already has a response")]
    ResponseExists { id: Uuid },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Raw-text parsing errors. A parse failure never yields a partial
/// field map — the diagnostic is all the caller gets.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Empty payload")]
    EmptyPayload,

    #[error("Malformed envelope header: {detail}")]
    MalformedHeader { detail: String },

    #[error("Malformed tag line {line_no}: {line:?}")]
    MalformedLine { line_no: usize, line: String },

    #[error("Duplicate tag :{tag}:")]
    DuplicateTag { tag: String },

    #[error("Missing required tag :{tag}: for kind {kind}")]
    MissingTag { kind: MessageKind, tag: String },

    #[error("Bad sequence value in :27:: {value:?}")]
    BadSequence { value: String },
}

/// Aggregate-store errors (guarantees and amendments).
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("Guarantee not found for reference {reference}")]
    NotFound { reference: String },

    #[error("Version conflict on guarantee {id}: expected {expected}, found {actual}")]
    VersionConflict { id: Uuid, expected: u64, actual: u64 },

    #[error("Duplicate guarantee reference: {reference}")]
    DuplicateReference { reference: String },
}

/// Business-action handler errors.
///
/// `is_permanent()` separates permanent-business failures (need manual
/// remediation) from transient ones (retry may succeed). Both consume
/// retry budget; the distinction drives alert tagging.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Related guarantee not found for reference {reference}")]
    RelatedGuaranteeNotFound { reference: String },

    #[error("Message carries no correlation reference")]
    MissingCorrelation,

    #[error("Parsed fields do not match kind {kind}")]
    FieldsMismatch { kind: MessageKind },

    #[error("Aggregate store: {0}")]
    Aggregate(#[from] AggregateError),
}

impl HandlerError {
    /// Whether this failure is a permanent business condition rather
    /// than a transient system fault.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::RelatedGuaranteeNotFound { .. }
                | Self::MissingCorrelation
                | Self::FieldsMismatch { .. }
        )
    }
}

/// Orchestrator-level errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Processing queue is closed")]
    QueueClosed,

    #[error("No parser registered for kind {kind}")]
    NoParser { kind: MessageKind },

    #[error("No handler registered for kind {kind}")]
    NoHandler { kind: MessageKind },

    #[error("Message {id} cannot be retried from status {status}")]
    NotRetryable { id: Uuid, status: MessageStatus },

    #[error("Message {id} has no parsed fields")]
    MissingFields { id: Uuid },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
