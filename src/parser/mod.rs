//! Field parsing — tag-block scanner plus a kind → parser registry.
//!
//! Parsing is deterministic: identical (text, kind) input always yields
//! an identical field map. A grammar mismatch fails with a diagnostic
//! and produces no partial output.

pub mod kinds;
pub mod tags;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ParseError;
use crate::message::{Envelope, MessageKind, ParsedFields};

/// Output of a successful parse: derived correlation data plus the
/// kind-specific typed field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub envelope: Envelope,
    pub fields: ParsedFields,
}

/// A parser for one message kind.
pub trait KindParser: Send + Sync {
    /// The kind this parser handles.
    fn kind(&self) -> MessageKind;

    /// Parse raw text into an envelope and typed fields.
    fn parse(&self, raw: &str) -> Result<Parsed, ParseError>;
}

/// Registry mapping each kind to its parser.
///
/// New kinds are added by registering a parser — the orchestrator never
/// branches on kind itself.
pub struct ParserRegistry {
    parsers: HashMap<MessageKind, Arc<dyn KindParser>>,
}

impl ParserRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with parsers for all six supported kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for parser in kinds::default_parsers() {
            registry.register(parser);
        }
        registry
    }

    /// Register (or replace) the parser for a kind.
    pub fn register(&mut self, parser: Arc<dyn KindParser>) {
        self.parsers.insert(parser.kind(), parser);
    }

    /// Look up the parser for `kind`.
    pub fn get(&self, kind: MessageKind) -> Option<&Arc<dyn KindParser>> {
        self.parsers.get(&kind)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_all_kinds() {
        let registry = ParserRegistry::with_defaults();
        for kind in MessageKind::ALL {
            assert!(registry.get(kind).is_some(), "missing parser for {kind}");
        }
    }

    #[test]
    fn register_replaces_existing_parser() {
        struct Stub;
        impl KindParser for Stub {
            fn kind(&self) -> MessageKind {
                MessageKind::FreeFormat
            }
            fn parse(&self, _raw: &str) -> Result<Parsed, ParseError> {
                Err(ParseError::EmptyPayload)
            }
        }

        let mut registry = ParserRegistry::with_defaults();
        registry.register(Arc::new(Stub));
        let parser = registry.get(MessageKind::FreeFormat).unwrap();
        assert!(parser.parse("anything").is_err());
    }
}
