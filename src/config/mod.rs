//! Configuration module for the sentinel proxy.
//!
//! Handles loading and validating proxy configuration from TOML files.

mod settings;

pub use settings::*;
