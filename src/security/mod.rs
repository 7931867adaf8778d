//! Envelope security layer.
//!
//! Handles payload canonicalization and signing, nonce-based replay
//! prevention, sliding-window flood detection, and expected-sequence
//! reorder detection.

mod flood;
mod nonce;
mod order;
mod signer;

pub use flood::FloodDetector;
pub use nonce::NonceCache;
pub use order::OrderValidator;
pub use signer::{unix_now, EnvelopeSigner};
