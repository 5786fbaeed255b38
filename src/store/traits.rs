//! `MessageStore` trait — single async interface for message persistence.
//!
//! The compare-and-set `transition` is the concurrency backbone of the
//! whole engine: every stage commits its transition through it before
//! the next stage begins, so two workers can never double-apply a
//! business effect for the same message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::{Envelope, Message, MessageStatus, ParsedFields};

/// Backend-agnostic message store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message. Fails on a duplicate engine reference.
    async fn insert(&self, message: Message) -> Result<(), StoreError>;

    /// Fetch by store identity.
    async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Fetch by engine reference.
    async fn get_by_reference(&self, reference: &str) -> Result<Option<Message>, StoreError>;

    /// Compare-and-set status transition.
    ///
    /// Fails with `StatusConflict` when the current status is not
    /// `from`, and with `IllegalTransition` when the edge is not part
    /// of the state machine. On success the relevant processing
    /// timestamps are stamped and the updated message is returned.
    async fn transition(
        &self,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<Message, StoreError>;

    /// Store the parser output: typed fields plus derived correlation columns.
    async fn set_parsed(
        &self,
        id: Uuid,
        fields: &ParsedFields,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Attach a failure diagnostic.
    async fn set_error(&self, id: Uuid, diagnostic: &str, now: DateTime<Utc>)
    -> Result<(), StoreError>;

    /// Update retry bookkeeping.
    async fn set_retry_state(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Link the guarantee aggregate this message produced or touched.
    async fn link_guarantee(
        &self,
        id: Uuid,
        guarantee_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Link the amendment record this message produced.
    async fn link_amendment(
        &self,
        id: Uuid,
        amendment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Store the generated response's id on the original.
    /// At most one response may ever exist per original.
    async fn set_response(
        &self,
        id: Uuid,
        response_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Append an audit note.
    async fn append_note(&self, id: Uuid, note: &str, now: DateTime<Utc>)
    -> Result<(), StoreError>;

    /// Reverse lookup: the response generated for `id`, if any.
    async fn response_of(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// RECEIVED messages plus retry-eligible error messages whose
    /// `next_retry_at` has elapsed, ordered by priority then receipt time.
    async fn due_for_processing(&self, now: DateTime<Utc>) -> Result<Vec<Message>, StoreError>;

    /// Messages sitting in PROCESSING since before `cutoff`.
    async fn stuck_in_processing(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<Message>, StoreError>;

    /// Number of messages currently in `status`.
    async fn count_by_status(&self, status: MessageStatus) -> Result<usize, StoreError>;
}
