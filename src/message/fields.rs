//! Typed field maps, keyed by message kind.
//!
//! Each kind gets its own struct so required fields are visible at the
//! type level; tags the grammar does not know about land in a
//! deterministic `extras` map instead of being dropped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::model::MessageKind;

/// Correlation data shared by every kind, lifted from the envelope
/// header and the 20/21/27 tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending institution (envelope block 1).
    pub sender: String,
    /// Receiving institution (envelope block 2).
    pub receiver: String,
    /// The sender's own message reference (:20:).
    pub sender_reference: String,
    /// Related/correlation reference (:21:).
    pub related_reference: Option<String>,
    /// Sequence within a correlated exchange (:27: "n/m").
    pub sequence: u32,
    /// Total messages in the exchange (:27: "n/m").
    pub sequence_total: u32,
}

/// Parsed field map. The tag discriminates by kind, giving
/// compile-time coverage of required fields per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedFields {
    ReceivedGuarantee(GuaranteeFields),
    Amendment(AmendmentFields),
    Acknowledgement(AckFields),
    AmendmentConfirmation(ConfirmationFields),
    DiscrepancyAdvice(DiscrepancyFields),
    FreeFormat(FreeFormatFields),
}

impl ParsedFields {
    /// The kind this field map belongs to.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ReceivedGuarantee(_) => MessageKind::ReceivedGuarantee,
            Self::Amendment(_) => MessageKind::Amendment,
            Self::Acknowledgement(_) => MessageKind::Acknowledgement,
            Self::AmendmentConfirmation(_) => MessageKind::AmendmentConfirmation,
            Self::DiscrepancyAdvice(_) => MessageKind::DiscrepancyAdvice,
            Self::FreeFormat(_) => MessageKind::FreeFormat,
        }
    }

    /// Unrecognized tags preserved during parsing.
    pub fn extras(&self) -> &BTreeMap<String, String> {
        match self {
            Self::ReceivedGuarantee(f) => &f.extras,
            Self::Amendment(f) => &f.extras,
            Self::Acknowledgement(f) => &f.extras,
            Self::AmendmentConfirmation(f) => &f.extras,
            Self::DiscrepancyAdvice(f) => &f.extras,
            Self::FreeFormat(f) => &f.extras,
        }
    }
}

/// Fields of a received guarantee (760).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeFields {
    /// Currency + amount composite as received (:32B:), e.g. `USD100000,00`.
    pub currency_amount: String,
    /// Date of issue (:30:), SWIFT YYMMDD.
    pub issue_date: String,
    /// Date of expiry (:31E:), SWIFT YYMMDD.
    pub expiry_date: String,
    /// Ordering customer (:50:).
    pub applicant: String,
    /// Beneficiary (:59:).
    pub beneficiary: String,
    /// Guarantee details narrative (:77C:).
    pub details: Option<String>,
    pub extras: BTreeMap<String, String>,
}

/// Fields of a guarantee amendment (767).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmendmentFields {
    /// Narrative describing the amendment (:77C:).
    pub narrative: String,
    /// New currency + amount composite, when the amount changes (:32B:).
    pub new_currency_amount: Option<String>,
    /// New expiry date, when the validity changes (:31E:).
    pub new_expiry_date: Option<String>,
    /// Date of amendment (:30:).
    pub amendment_date: Option<String>,
    pub extras: BTreeMap<String, String>,
}

/// Fields of an acknowledgement (768).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFields {
    /// Sender-to-receiver information (:72:).
    pub narrative: Option<String>,
    pub extras: BTreeMap<String, String>,
}

/// Fields of an amendment processing confirmation (769).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationFields {
    /// Sender-to-receiver information (:72:).
    pub narrative: Option<String>,
    pub extras: BTreeMap<String, String>,
}

/// Fields of a discrepancy advice (750).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscrepancyFields {
    /// Discrepancy narrative (:77A:).
    pub discrepancies: String,
    /// Charge details (:71B:).
    pub charges: Option<String>,
    pub extras: BTreeMap<String, String>,
}

/// Fields of a free-format message (799).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeFormatFields {
    /// Narrative text (:79:).
    pub narrative: String,
    pub extras: BTreeMap<String, String>,
}
