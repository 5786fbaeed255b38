//! Response generation for kinds that require an acknowledgement.
//!
//! Idempotent: an original that already carries a response link is
//! skipped, and a dangling response found through the reverse index is
//! re-linked instead of duplicated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{Error, StoreError};
use crate::message::{Message, MessageKind};
use crate::refs::ReferenceGenerator;
use crate::store::MessageStore;

/// Synthesizes and persists linked response messages.
pub struct ResponseGenerator {
    store: Arc<dyn MessageStore>,
    refs: Arc<dyn ReferenceGenerator>,
}

impl ResponseGenerator {
    pub fn new(store: Arc<dyn MessageStore>, refs: Arc<dyn ReferenceGenerator>) -> Self {
        Self { store, refs }
    }

    /// Generate the response for `original` if its kind requires one
    /// and none exists yet. Returns the response only when newly created.
    pub async fn generate(
        &self,
        original: &Message,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>, Error> {
        let Some(kind) = original.kind.response_kind() else {
            return Ok(None);
        };
        if original.response_id.is_some() {
            debug!(
                message_id = %original.id,
                "Response already linked, skipping generation"
            );
            return Ok(None);
        }
        // A crash between insert and back-link leaves a response that
        // only the reverse index knows about. Heal the link, don't
        // generate a second response.
        if let Some(existing) = self.store.response_of(original.id).await? {
            debug!(
                message_id = %original.id,
                response_id = %existing.id,
                "Dangling response found, re-linking"
            );
            match self.store.set_response(original.id, existing.id, now).await {
                Ok(()) | Err(StoreError::ResponseExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(None);
        }

        let reference = self.refs.next("RSP");
        let raw = render_response(&reference, kind, original);
        let response = Message::response(reference, kind, raw, original, now);

        // The store enforces at most one response per original; a racer
        // losing either write simply backs off.
        match self.store.insert(response.clone()).await {
            Ok(()) => {}
            Err(StoreError::ResponseExists { .. }) => {
                debug!(message_id = %original.id, "Response created concurrently, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        match self.store.set_response(original.id, response.id, now).await {
            Ok(()) => {}
            Err(StoreError::ResponseExists { .. }) => {
                debug!(message_id = %original.id, "Response linked concurrently");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            message_id = %original.id,
            response_id = %response.id,
            response_kind = %kind,
            "Response generated"
        );
        Ok(Some(response))
    }
}

/// Render the response payload: parties swapped, original reference
/// quoted in `:21:`.
fn render_response(reference: &str, kind: MessageKind, original: &Message) -> String {
    let sender = original.receiver.as_deref().unwrap_or("UNKNOWN");
    let receiver = original.sender.as_deref().unwrap_or("UNKNOWN");
    let narrative = match kind {
        MessageKind::AmendmentConfirmation => "/CONF/ AMENDMENT PROCESSED",
        _ => "/ACK/ MESSAGE RECEIVED AND PROCESSED",
    };
    format!(
        "{{1:{sender}}}{{2:{receiver}}}\n:20:{reference}\n:21:{original_ref}\n:72:{narrative}\n",
        original_ref = original.reference
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageStatus;
    use crate::refs::CounterReferenceGenerator;
    use crate::store::MemoryMessageStore;

    fn processed_original(kind: MessageKind) -> Message {
        let now = Utc::now();
        let mut msg = Message::inbound("MSG-1", kind, "raw", 3, now);
        msg.status = MessageStatus::Processed;
        msg.sender = Some("BANKBEBB".into());
        msg.receiver = Some("BANKUS33".into());
        msg
    }

    async fn setup(kind: MessageKind) -> (Arc<MemoryMessageStore>, ResponseGenerator, Message) {
        let store = Arc::new(MemoryMessageStore::new());
        let original = processed_original(kind);
        store.insert(original.clone()).await.unwrap();
        let generator = ResponseGenerator::new(
            store.clone(),
            Arc::new(CounterReferenceGenerator::new()),
        );
        (store, generator, original)
    }

    #[tokio::test]
    async fn generates_linked_acknowledgement() {
        let (store, generator, original) = setup(MessageKind::ReceivedGuarantee).await;
        let now = Utc::now();

        let response = generator.generate(&original, now).await.unwrap().unwrap();
        assert_eq!(response.kind, MessageKind::Acknowledgement);
        assert_eq!(response.status, MessageStatus::Processed);
        assert_eq!(response.parent_id, Some(original.id));
        assert_eq!(response.sender.as_deref(), Some("BANKUS33"));
        assert_eq!(response.receiver.as_deref(), Some("BANKBEBB"));
        assert!(response.raw.contains(&format!(":21:{}", original.reference)));

        let stored = store.get(original.id).await.unwrap().unwrap();
        assert_eq!(stored.response_id, Some(response.id));
    }

    #[tokio::test]
    async fn amendment_gets_processing_confirmation() {
        let (_store, generator, original) = setup(MessageKind::Amendment).await;
        let response = generator
            .generate(&original, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.kind, MessageKind::AmendmentConfirmation);
        assert!(response.raw.contains("/CONF/"));
    }

    #[tokio::test]
    async fn second_invocation_is_a_no_op() {
        let (store, generator, original) = setup(MessageKind::ReceivedGuarantee).await;
        let now = Utc::now();

        let first = generator.generate(&original, now).await.unwrap();
        assert!(first.is_some());

        // Re-load so the response link is visible, as the engine would
        let reloaded = store.get(original.id).await.unwrap().unwrap();
        let second = generator.generate(&reloaded, now).await.unwrap();
        assert!(second.is_none());

        // Exactly one response exists
        let response = store.response_of(original.id).await.unwrap().unwrap();
        assert_eq!(reloaded.response_id, Some(response.id));
    }

    #[tokio::test]
    async fn dangling_response_is_relinked_not_duplicated() {
        let (store, generator, original) = setup(MessageKind::ReceivedGuarantee).await;
        let now = Utc::now();

        // Simulate a crash after insert but before back-link
        let dangling = Message::response(
            "RSP-ORPHAN",
            MessageKind::Acknowledgement,
            "raw",
            &original,
            now,
        );
        store.insert(dangling.clone()).await.unwrap();

        let result = generator.generate(&original, now).await.unwrap();
        assert!(result.is_none());

        let healed = store.get(original.id).await.unwrap().unwrap();
        assert_eq!(healed.response_id, Some(dangling.id));
    }

    #[tokio::test]
    async fn kinds_without_response_are_skipped() {
        let (_store, generator, original) = setup(MessageKind::FreeFormat).await;
        let result = generator.generate(&original, Utc::now()).await.unwrap();
        assert!(result.is_none());
    }
}
