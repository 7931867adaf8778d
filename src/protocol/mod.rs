//! Wire protocol module.
//!
//! Defines the signed envelope format, payload canonicalization, and the
//! minimal inner-frame view the security layer consumes.

mod envelope;
mod frame;

pub use envelope::{canonicalize, CanonicalPayload, Envelope, ENVELOPE_VERSION};
pub use frame::{InnerFrame, MESSAGE_TYPE_CALL, MESSAGE_TYPE_CALL_RESULT};
