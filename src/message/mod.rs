//! Message model — record, kinds, status state machine, typed fields.

pub mod fields;
pub mod model;

pub use fields::{
    AckFields, AmendmentFields, ConfirmationFields, DiscrepancyFields, Envelope, FreeFormatFields,
    GuaranteeFields, ParsedFields,
};
pub use model::{Message, MessageKind, MessageStatus};
