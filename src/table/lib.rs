//! Sorted table of hash ranges and their owning nodes

#[macro_use]
extern crate tracing;

mod ranges;

pub use ranges::*;
