//! Per-kind parsers for the six supported message kinds.
//!
//! Each parser consumes the tags its grammar knows about and preserves
//! the rest as extras. Shape and business checks (currency codes, date
//! ordering, amount scale) are the validator's job — a parser only
//! cares that the required tags are present.

use std::sync::Arc;

use crate::error::ParseError;
use crate::message::{
    AckFields, AmendmentFields, ConfirmationFields, DiscrepancyFields, Envelope, FreeFormatFields,
    GuaranteeFields, MessageKind, ParsedFields,
};
use crate::parser::tags::{TagMap, TagScanner};
use crate::parser::{KindParser, Parsed};

/// Parsers for all six supported kinds, sharing one scanner.
pub fn default_parsers() -> Vec<Arc<dyn KindParser>> {
    let scanner = Arc::new(TagScanner::new());
    vec![
        Arc::new(ReceivedGuaranteeParser {
            scanner: scanner.clone(),
        }),
        Arc::new(AmendmentParser {
            scanner: scanner.clone(),
        }),
        Arc::new(NarrativeParser {
            scanner: scanner.clone(),
            kind: MessageKind::Acknowledgement,
        }),
        Arc::new(NarrativeParser {
            scanner: scanner.clone(),
            kind: MessageKind::AmendmentConfirmation,
        }),
        Arc::new(DiscrepancyAdviceParser {
            scanner: scanner.clone(),
        }),
        Arc::new(FreeFormatParser { scanner }),
    ]
}

/// Build the envelope from the scanned header and the 20/21/27 tags.
fn build_envelope(
    tags: &mut TagMap,
    sender: &str,
    receiver: &str,
    kind: MessageKind,
    related_required: bool,
) -> Result<Envelope, ParseError> {
    let sender_reference = tags.require("20", kind)?;
    let related_reference = if related_required {
        Some(tags.require("21", kind)?)
    } else {
        tags.take("21")
    };
    let (sequence, sequence_total) = match tags.take("27") {
        Some(value) => parse_sequence(&value)?,
        None => (1, 1),
    };

    Ok(Envelope {
        sender: sender.to_string(),
        receiver: receiver.to_string(),
        sender_reference,
        related_reference,
        sequence,
        sequence_total,
    })
}

/// Parse a `:27:` value of the form `n/m`, with `1 <= n <= m`.
fn parse_sequence(value: &str) -> Result<(u32, u32), ParseError> {
    let bad = || ParseError::BadSequence {
        value: value.to_string(),
    };
    let (n, m) = value.split_once('/').ok_or_else(bad)?;
    let n: u32 = n.trim().parse().map_err(|_| bad())?;
    let m: u32 = m.trim().parse().map_err(|_| bad())?;
    if n == 0 || m == 0 || n > m {
        return Err(bad());
    }
    Ok((n, m))
}

// ── Received guarantee (760) ────────────────────────────────────────

struct ReceivedGuaranteeParser {
    scanner: Arc<TagScanner>,
}

impl KindParser for ReceivedGuaranteeParser {
    fn kind(&self) -> MessageKind {
        MessageKind::ReceivedGuarantee
    }

    fn parse(&self, raw: &str) -> Result<Parsed, ParseError> {
        let scanned = self.scanner.scan(raw)?;
        let mut tags = scanned.tags;
        let envelope = build_envelope(&mut tags, &scanned.sender, &scanned.receiver, self.kind(), false)?;

        let fields = GuaranteeFields {
            currency_amount: tags.require("32B", self.kind())?,
            issue_date: tags.require("30", self.kind())?,
            expiry_date: tags.require("31E", self.kind())?,
            applicant: tags.require("50", self.kind())?,
            beneficiary: tags.require("59", self.kind())?,
            details: tags.take("77C"),
            extras: tags.into_extras(),
        };

        Ok(Parsed {
            envelope,
            fields: ParsedFields::ReceivedGuarantee(fields),
        })
    }
}

// ── Amendment (767) ─────────────────────────────────────────────────

struct AmendmentParser {
    scanner: Arc<TagScanner>,
}

impl KindParser for AmendmentParser {
    fn kind(&self) -> MessageKind {
        MessageKind::Amendment
    }

    fn parse(&self, raw: &str) -> Result<Parsed, ParseError> {
        let scanned = self.scanner.scan(raw)?;
        let mut tags = scanned.tags;
        let envelope = build_envelope(&mut tags, &scanned.sender, &scanned.receiver, self.kind(), true)?;

        let fields = AmendmentFields {
            narrative: tags.require("77C", self.kind())?,
            new_currency_amount: tags.take("32B"),
            new_expiry_date: tags.take("31E"),
            amendment_date: tags.take("30"),
            extras: tags.into_extras(),
        };

        Ok(Parsed {
            envelope,
            fields: ParsedFields::Amendment(fields),
        })
    }
}

// ── Acknowledgement (768) / amendment confirmation (769) ────────────

/// Both acknowledgement kinds share the same narrow grammar: a related
/// reference plus optional sender-to-receiver information.
struct NarrativeParser {
    scanner: Arc<TagScanner>,
    kind: MessageKind,
}

impl KindParser for NarrativeParser {
    fn kind(&self) -> MessageKind {
        self.kind
    }

    fn parse(&self, raw: &str) -> Result<Parsed, ParseError> {
        let scanned = self.scanner.scan(raw)?;
        let mut tags = scanned.tags;
        let envelope = build_envelope(&mut tags, &scanned.sender, &scanned.receiver, self.kind, true)?;
        let narrative = tags.take("72");
        let extras = tags.into_extras();

        let fields = match self.kind {
            MessageKind::AmendmentConfirmation => {
                ParsedFields::AmendmentConfirmation(ConfirmationFields { narrative, extras })
            }
            _ => ParsedFields::Acknowledgement(AckFields { narrative, extras }),
        };

        Ok(Parsed { envelope, fields })
    }
}

// ── Discrepancy advice (750) ────────────────────────────────────────

struct DiscrepancyAdviceParser {
    scanner: Arc<TagScanner>,
}

impl KindParser for DiscrepancyAdviceParser {
    fn kind(&self) -> MessageKind {
        MessageKind::DiscrepancyAdvice
    }

    fn parse(&self, raw: &str) -> Result<Parsed, ParseError> {
        let scanned = self.scanner.scan(raw)?;
        let mut tags = scanned.tags;
        let envelope = build_envelope(&mut tags, &scanned.sender, &scanned.receiver, self.kind(), true)?;

        let fields = DiscrepancyFields {
            discrepancies: tags.require("77A", self.kind())?,
            charges: tags.take("71B"),
            extras: tags.into_extras(),
        };

        Ok(Parsed {
            envelope,
            fields: ParsedFields::DiscrepancyAdvice(fields),
        })
    }
}

// ── Free format (799) ───────────────────────────────────────────────

struct FreeFormatParser {
    scanner: Arc<TagScanner>,
}

impl KindParser for FreeFormatParser {
    fn kind(&self) -> MessageKind {
        MessageKind::FreeFormat
    }

    fn parse(&self, raw: &str) -> Result<Parsed, ParseError> {
        let scanned = self.scanner.scan(raw)?;
        let mut tags = scanned.tags;
        let envelope = build_envelope(&mut tags, &scanned.sender, &scanned.receiver, self.kind(), false)?;

        let fields = FreeFormatFields {
            narrative: tags.require("79", self.kind())?,
            extras: tags.into_extras(),
        };

        Ok(Parsed {
            envelope,
            fields: ParsedFields::FreeFormat(fields),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParserRegistry;

    const GUARANTEE_RAW: &str = "{1:BANKBEBB}{2:BANKUS33}\n\
        :20:GTEE-REF-001\n\
        :27:1/1\n\
        :32B:USD100000,00\n\
        :30:260601\n\
        :31E:270601\n\
        :50:ACME INDUSTRIES NV\n\
        :59:GLOBEX CORPORATION\n\
        :77C:PERFORMANCE GUARANTEE\nCONTRACT 4711\n";

    fn parse(kind: MessageKind, raw: &str) -> Result<Parsed, ParseError> {
        let registry = ParserRegistry::with_defaults();
        registry.get(kind).unwrap().parse(raw)
    }

    #[test]
    fn received_guarantee_full_parse() {
        let parsed = parse(MessageKind::ReceivedGuarantee, GUARANTEE_RAW).unwrap();
        assert_eq!(parsed.envelope.sender, "BANKBEBB");
        assert_eq!(parsed.envelope.receiver, "BANKUS33");
        assert_eq!(parsed.envelope.sender_reference, "GTEE-REF-001");
        assert_eq!(parsed.envelope.sequence, 1);

        let ParsedFields::ReceivedGuarantee(fields) = parsed.fields else {
            panic!("wrong field variant");
        };
        assert_eq!(fields.currency_amount, "USD100000,00");
        assert_eq!(fields.issue_date, "260601");
        assert_eq!(fields.expiry_date, "270601");
        assert_eq!(fields.applicant, "ACME INDUSTRIES NV");
        assert_eq!(fields.beneficiary, "GLOBEX CORPORATION");
        assert_eq!(
            fields.details.as_deref(),
            Some("PERFORMANCE GUARANTEE\nCONTRACT 4711")
        );
        assert!(fields.extras.is_empty());
    }

    #[test]
    fn parsing_is_deterministic() {
        let first = parse(MessageKind::ReceivedGuarantee, GUARANTEE_RAW).unwrap();
        let second = parse(MessageKind::ReceivedGuarantee, GUARANTEE_RAW).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_amount_composite_fails() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\n\
            :20:GTEE-REF-002\n\
            :30:260601\n\
            :31E:270601\n\
            :50:ACME\n\
            :59:GLOBEX\n";
        let err = parse(MessageKind::ReceivedGuarantee, raw).unwrap_err();
        assert!(matches!(err, ParseError::MissingTag { tag, .. } if tag == "32B"));
    }

    #[test]
    fn unknown_tags_land_in_extras() {
        let raw = format!("{GUARANTEE_RAW}:23:CANCEL\n");
        let parsed = parse(MessageKind::ReceivedGuarantee, &raw).unwrap();
        assert_eq!(
            parsed.fields.extras().get("23").map(String::as_str),
            Some("CANCEL")
        );
    }

    #[test]
    fn amendment_requires_correlation_reference() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\n\
            :20:AMND-REF-001\n\
            :77C:AMOUNT INCREASED\n";
        let err = parse(MessageKind::Amendment, raw).unwrap_err();
        assert!(matches!(err, ParseError::MissingTag { tag, .. } if tag == "21"));
    }

    #[test]
    fn amendment_with_new_amount() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\n\
            :20:AMND-REF-001\n\
            :21:GTEE-REF-001\n\
            :32B:USD150000,00\n\
            :77C:AMOUNT INCREASED TO USD 150000\n";
        let parsed = parse(MessageKind::Amendment, raw).unwrap();
        assert_eq!(
            parsed.envelope.related_reference.as_deref(),
            Some("GTEE-REF-001")
        );
        let ParsedFields::Amendment(fields) = parsed.fields else {
            panic!("wrong field variant");
        };
        assert_eq!(fields.new_currency_amount.as_deref(), Some("USD150000,00"));
        assert_eq!(fields.narrative, "AMOUNT INCREASED TO USD 150000");
    }

    #[test]
    fn acknowledgement_parses_narrative() {
        let raw = "{1:BANKUS33}{2:BANKBEBB}\n\
            :20:ACK-REF-001\n\
            :21:GTEE-REF-001\n\
            :72:/ACK/ RECEIVED IN ORDER\n";
        let parsed = parse(MessageKind::Acknowledgement, raw).unwrap();
        let ParsedFields::Acknowledgement(fields) = parsed.fields else {
            panic!("wrong field variant");
        };
        assert_eq!(fields.narrative.as_deref(), Some("/ACK/ RECEIVED IN ORDER"));
    }

    #[test]
    fn confirmation_uses_its_own_variant() {
        let raw = "{1:BANKUS33}{2:BANKBEBB}\n\
            :20:CONF-REF-001\n\
            :21:AMND-REF-001\n";
        let parsed = parse(MessageKind::AmendmentConfirmation, raw).unwrap();
        assert!(matches!(
            parsed.fields,
            ParsedFields::AmendmentConfirmation(_)
        ));
    }

    #[test]
    fn discrepancy_advice_requires_narrative() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\n\
            :20:DISC-REF-001\n\
            :21:GTEE-REF-001\n";
        let err = parse(MessageKind::DiscrepancyAdvice, raw).unwrap_err();
        assert!(matches!(err, ParseError::MissingTag { tag, .. } if tag == "77A"));
    }

    #[test]
    fn free_format_requires_body() {
        let raw = "{1:BANKBEBB}{2:BANKUS33}\n:20:FREE-REF-001\n:79:PLEASE ADVISE STATUS\n";
        let parsed = parse(MessageKind::FreeFormat, raw).unwrap();
        let ParsedFields::FreeFormat(fields) = parsed.fields else {
            panic!("wrong field variant");
        };
        assert_eq!(fields.narrative, "PLEASE ADVISE STATUS");
    }

    #[test]
    fn sequence_grammar() {
        assert_eq!(parse_sequence("1/1").unwrap(), (1, 1));
        assert_eq!(parse_sequence("2/3").unwrap(), (2, 3));
        assert!(parse_sequence("3/2").is_err());
        assert!(parse_sequence("0/1").is_err());
        assert!(parse_sequence("x/y").is_err());
        assert!(parse_sequence("12").is_err());
    }
}
