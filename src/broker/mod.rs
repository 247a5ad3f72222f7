//! Broker module
//!
//! Group membership and event fan-out. Connections join groups keyed by
//! event id; scan updates published to a group reach every member.

mod group;
mod local;

pub use group::*;
pub use local::*;
