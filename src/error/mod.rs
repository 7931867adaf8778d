//! Error types for the sentinel proxy.
//!
//! Provides a unified error handling system using thiserror.

mod types;

pub use types::*;
