//! File-backed data blocks and the range-mapped storage layer

#[macro_use]
extern crate tracing;

mod data_block;
mod fs_range;
mod header;
mod locks;

pub use data_block::*;
pub use fs_range::*;
pub use header::*;
pub use locks::*;
