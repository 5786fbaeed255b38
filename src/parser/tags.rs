//! Tag-block scanner for the raw wire format.
//!
//! A message is an envelope header line `{1:SENDER}{2:RECEIVER}`
//! followed by `:NN:value` tag lines. A line that does not start a new
//! tag folds into the previous tag's value (narrative fields span
//! multiple lines).

use std::collections::BTreeMap;

use regex::Regex;

use crate::error::ParseError;
use crate::message::MessageKind;

/// Scanned message: envelope parties plus the tag map.
#[derive(Debug, Clone)]
pub struct ScannedMessage {
    pub sender: String,
    pub receiver: String,
    pub tags: TagMap,
}

/// Ordered tag → value map with consume semantics.
///
/// Per-kind parsers `take` the tags they know; whatever is left becomes
/// the `extras` escape hatch.
#[derive(Debug, Clone, Default)]
pub struct TagMap {
    tags: BTreeMap<String, String>,
}

impl TagMap {
    /// Remove and return a required tag.
    pub fn require(&mut self, tag: &str, kind: MessageKind) -> Result<String, ParseError> {
        self.tags.remove(tag).ok_or_else(|| ParseError::MissingTag {
            kind,
            tag: tag.to_string(),
        })
    }

    /// Remove and return an optional tag.
    pub fn take(&mut self, tag: &str) -> Option<String> {
        self.tags.remove(tag)
    }

    /// Everything not consumed by the grammar.
    pub fn into_extras(self) -> BTreeMap<String, String> {
        self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Scanner with pre-compiled line grammars.
pub struct TagScanner {
    header_re: Regex,
    tag_re: Regex,
}

impl TagScanner {
    pub fn new() -> Self {
        Self {
            header_re: Regex::new(r"^\{1:([A-Z0-9]{8,11})\}\{2:([A-Z0-9]{8,11})\}$").unwrap(),
            tag_re: Regex::new(r"^:([0-9]{2}[A-Z]?):(.*)$").unwrap(),
        }
    }

    /// Scan raw text into envelope parties and a tag map.
    pub fn scan(&self, raw: &str) -> Result<ScannedMessage, ParseError> {
        let mut lines = raw.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

        let Some((_, header)) = lines.next() else {
            return Err(ParseError::EmptyPayload);
        };
        let captures =
            self.header_re
                .captures(header.trim())
                .ok_or_else(|| ParseError::MalformedHeader {
                    detail: format!("expected {{1:SENDER}}{{2:RECEIVER}}, got {header:?}"),
                })?;
        let sender = captures[1].to_string();
        let receiver = captures[2].to_string();

        let mut tags: BTreeMap<String, String> = BTreeMap::new();
        let mut current: Option<String> = None;

        for (line_no, line) in lines {
            let line = line.trim_end();
            if let Some(captures) = self.tag_re.captures(line) {
                let tag = captures[1].to_string();
                let value = captures[2].trim().to_string();
                if tags.contains_key(&tag) {
                    return Err(ParseError::DuplicateTag { tag });
                }
                tags.insert(tag.clone(), value);
                current = Some(tag);
            } else if let Some(value) = current.as_ref().and_then(|tag| tags.get_mut(tag)) {
                // Continuation line of a narrative field
                value.push('\n');
                value.push_str(line.trim());
            } else {
                return Err(ParseError::MalformedLine {
                    line_no: line_no + 1,
                    line: line.to_string(),
                });
            }
        }

        Ok(ScannedMessage {
            sender,
            receiver,
            tags: TagMap { tags },
        })
    }
}

impl Default for TagScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(raw: &str) -> Result<ScannedMessage, ParseError> {
        TagScanner::new().scan(raw)
    }

    #[test]
    fn scans_header_and_tags() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\n:20:GTEE-1\n:32B:USD100000,00\n";
        let scanned = scan(raw).unwrap();
        assert_eq!(scanned.sender, "BANKBEBB");
        assert_eq!(scanned.receiver, "BANKUS33");
        let mut tags = scanned.tags;
        assert_eq!(
            tags.require("20", MessageKind::ReceivedGuarantee).unwrap(),
            "GTEE-1"
        );
        assert_eq!(tags.take("32B").as_deref(), Some("USD100000,00"));
        assert!(tags.is_empty());
    }

    #[test]
    fn continuation_lines_fold_into_previous_tag() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\n:77C:FIRST LINE\nSECOND LINE\nTHIRD LINE\n";
        let mut tags = scan(raw).unwrap().tags;
        assert_eq!(
            tags.take("77C").as_deref(),
            Some("FIRST LINE\nSECOND LINE\nTHIRD LINE")
        );
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(matches!(scan("   \n  "), Err(ParseError::EmptyPayload)));
    }

    #[test]
    fn malformed_header_rejected() {
        let err = scan(":20:NO-HEADER\n").unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader { .. }));
    }

    #[test]
    fn text_before_first_tag_rejected() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\nstray text\n:20:REF\n";
        let err = scan(raw).unwrap_err();
        assert!(matches!(err, ParseError::MalformedLine { .. }));
    }

    #[test]
    fn duplicate_tag_rejected() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\n:20:A\n:20:B\n";
        let err = scan(raw).unwrap_err();
        assert!(matches!(err, ParseError::DuplicateTag { tag } if tag == "20"));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\n\n:20:REF\n\n";
        let mut tags = scan(raw).unwrap().tags;
        assert_eq!(
            tags.require("20", MessageKind::FreeFormat).unwrap(),
            "REF"
        );
    }
}
