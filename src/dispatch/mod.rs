//! Business-action dispatch — one handler per kind, resolved by registry.

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::HandlerError;
use crate::guarantee::GuaranteeStore;
use crate::message::{Message, MessageKind, ParsedFields};
use crate::refs::ReferenceGenerator;

/// Result of a successful business action.
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    /// Guarantee aggregate the message produced or touched.
    pub guarantee_id: Option<Uuid>,
    /// Amendment record the message produced.
    pub amendment_id: Option<Uuid>,
    /// Audit note to append to the message.
    pub note: Option<String>,
}

/// A business-action handler for one message kind.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// The kind this handler processes.
    fn kind(&self) -> MessageKind;

    /// Apply the business action for a validated message.
    ///
    /// Must be idempotent under re-delivery: called again for a message
    /// whose effect already exists, it returns the existing links
    /// instead of applying the effect twice.
    async fn process(
        &self,
        message: &Message,
        fields: &ParsedFields,
    ) -> Result<ActionOutcome, HandlerError>;
}

/// Registry mapping each kind to its handler.
pub struct ActionDispatcher {
    handlers: HashMap<MessageKind, Arc<dyn ActionHandler>>,
}

impl ActionDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Dispatcher with the default handler for every supported kind.
    pub fn with_defaults(
        guarantees: Arc<dyn GuaranteeStore>,
        refs: Arc<dyn ReferenceGenerator>,
    ) -> Self {
        let mut dispatcher = Self::new();
        for handler in handlers::default_handlers(guarantees, refs) {
            dispatcher.register(handler);
        }
        dispatcher
    }

    /// Register (or replace) the handler for a kind.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Look up the handler for `kind`.
    pub fn get(&self, kind: MessageKind) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(&kind)
    }
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
