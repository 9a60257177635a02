//! Per-user filesystem-like metadata trees, stored in an embedded ordered
//! key-value store and replicated across metadata owner nodes

#[macro_use]
extern crate tracing;

mod archive;
mod cache;
mod records;
mod store;

pub use archive::*;
pub use cache::*;
pub use records::*;
pub use store::*;
