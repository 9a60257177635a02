//! Ring membership state machine, data-path operations and the periodic
//! repair and rebalancing tasks of a Ringstore node

#[macro_use]
extern crate tracing;

pub mod client;
pub mod operator;
pub mod ops;
pub mod proto;
pub mod repair;
pub mod tasks;
