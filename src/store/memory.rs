//! In-memory message store — tests, demos, and single-process setups.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::{Envelope, Message, MessageStatus, ParsedFields};
use crate::store::traits::MessageStore;

#[derive(Default)]
struct Inner {
    messages: HashMap<Uuid, Message>,
    by_reference: HashMap<String, Uuid>,
}

/// Message store backed by an in-process map.
#[derive(Default)]
pub struct MemoryMessageStore {
    inner: RwLock<Inner>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn get_mut(&mut self, id: Uuid) -> Result<&mut Message, StoreError> {
        self.messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound { id })
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: Message) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.by_reference.contains_key(&message.reference) {
            return Err(StoreError::DuplicateReference {
                reference: message.reference,
            });
        }
        // At most one response per original, enforced at insert so two
        // racing generators cannot both persist one.
        if let Some(parent_id) = message.parent_id {
            if inner.messages.values().any(|m| m.parent_id == Some(parent_id)) {
                return Err(StoreError::ResponseExists { id: parent_id });
            }
        }
        inner
            .by_reference
            .insert(message.reference.clone(), message.id);
        inner.messages.insert(message.id, message);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.inner.read().await.messages.get(&id).cloned())
    }

    async fn get_by_reference(&self, reference: &str) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_reference
            .get(reference)
            .and_then(|id| inner.messages.get(id))
            .cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner.get_mut(id)?;
        if msg.status != from {
            return Err(StoreError::StatusConflict {
                id,
                expected: from,
                actual: msg.status,
            });
        }
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { id, from, to });
        }
        msg.apply_status(to, now);
        Ok(msg.clone())
    }

    async fn set_parsed(
        &self,
        id: Uuid,
        fields: &ParsedFields,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner.get_mut(id)?;
        msg.fields = Some(fields.clone());
        msg.sender = Some(envelope.sender.clone());
        msg.receiver = Some(envelope.receiver.clone());
        msg.sender_reference = Some(envelope.sender_reference.clone());
        msg.transaction_reference = envelope.related_reference.clone();
        msg.sequence = envelope.sequence;
        msg.updated_at = now;
        Ok(())
    }

    async fn set_error(
        &self,
        id: Uuid,
        diagnostic: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner.get_mut(id)?;
        msg.error = Some(diagnostic.to_string());
        msg.updated_at = now;
        Ok(())
    }

    async fn set_retry_state(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner.get_mut(id)?;
        msg.retry_count = retry_count;
        msg.next_retry_at = next_retry_at;
        msg.updated_at = now;
        Ok(())
    }

    async fn link_guarantee(
        &self,
        id: Uuid,
        guarantee_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner.get_mut(id)?;
        msg.guarantee_id = Some(guarantee_id);
        msg.updated_at = now;
        Ok(())
    }

    async fn link_amendment(
        &self,
        id: Uuid,
        amendment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner.get_mut(id)?;
        msg.amendment_id = Some(amendment_id);
        msg.updated_at = now;
        Ok(())
    }

    async fn set_response(
        &self,
        id: Uuid,
        response_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner.get_mut(id)?;
        if msg.response_id.is_some() {
            return Err(StoreError::ResponseExists { id });
        }
        msg.response_id = Some(response_id);
        msg.updated_at = now;
        Ok(())
    }

    async fn append_note(
        &self,
        id: Uuid,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner.get_mut(id)?;
        msg.notes.push(note.to_string());
        msg.updated_at = now;
        Ok(())
    }

    async fn response_of(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .values()
            .find(|m| m.parent_id == Some(id))
            .cloned())
    }

    async fn due_for_processing(&self, now: DateTime<Utc>) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let mut due: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Received || m.retry_eligible(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.received_at.cmp(&b.received_at))
        });
        Ok(due)
    }

    async fn stuck_in_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .values()
            .filter(|m| {
                m.status == MessageStatus::Processing
                    && m.processing_started_at.is_some_and(|at| at <= cutoff)
            })
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: MessageStatus) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .values()
            .filter(|m| m.status == status)
            .count())
    }
}
