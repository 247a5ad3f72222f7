//! Configuration module
//!
//! Handles loading relay settings from a TOML file with sensible defaults.

mod relay;

pub use relay::*;
