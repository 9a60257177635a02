//! Request/response RPC transport with optional binary streams
//!
//! The message vocabulary itself is defined by the caller as a serde enum;
//! this crate only knows how to frame, send, receive and dispatch it.

#[macro_use]
extern crate tracing;

mod codec;
mod envelope;
mod rpc_client;
mod rpc_server;

pub use codec::*;
pub use envelope::*;
pub use rpc_client::*;
pub use rpc_server::*;
