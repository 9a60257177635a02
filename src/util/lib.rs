//! Crate containing common functions and types used in Ringstore

#[macro_use]
extern crate tracing;

pub mod background;
pub mod config;
pub mod error;
pub mod key;
pub mod time;

/// Minimum number of replicas a data block must be stored with
pub const MIN_REPLICA_COUNT: u8 = 2;
