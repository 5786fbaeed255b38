//! Operational alerting sink.
//!
//! The engine never pages anyone itself — it hands tagged alerts to a
//! sink. The tag separates "needs a code or data fix" (permanent
//! business failures) from "needs manual reprocessing" (exhausted
//! retries) and "needs a human look" (stuck messages).

use async_trait::async_trait;
use uuid::Uuid;

use crate::message::MessageKind;

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// The retry budget is used up; the message stays in its error state.
    RetriesExhausted,
    /// A permanent business condition (e.g. missing correlation target).
    PermanentFailure,
    /// A message sat in PROCESSING past the timeout threshold. Never
    /// auto-retried — side effects may be partially applied.
    StuckMessage,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::PermanentFailure => "permanent_failure",
            Self::StuckMessage => "stuck_message",
        }
    }
}

/// An alert handed to the operational sink.
#[derive(Debug, Clone)]
pub struct OperationalAlert {
    pub kind: AlertKind,
    pub message_id: Uuid,
    pub reference: String,
    pub message_kind: MessageKind,
    pub detail: String,
}

/// Sink for operational alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: OperationalAlert);
}

/// Default sink that emits structured logs.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, alert: OperationalAlert) {
        tracing::error!(
            kind = alert.kind.as_str(),
            message_id = %alert.message_id,
            reference = %alert.reference,
            message_kind = %alert.message_kind,
            detail = %alert.detail,
            "Operational alert"
        );
    }
}
