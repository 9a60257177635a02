use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Capability class of a request sender; handlers declare which roles
/// they accept
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Role {
	Node,
	Client,
	Monitor,
}

/// Request envelope framing a typed message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request<M> {
	pub sender: SocketAddr,
	pub role: Role,
	pub msg: M,
	/// Whether a binary stream follows the envelope on the wire
	pub has_data: bool,
}

impl<M> Request<M> {
	pub fn new(sender: SocketAddr, role: Role, msg: M) -> Self {
		Self {
			sender,
			role,
			msg,
			has_data: false,
		}
	}
}

/// Response envelope: a stable numeric code, a human-readable message and
/// a typed body
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response<B> {
	pub code: i64,
	pub message: String,
	pub body: B,
	/// Whether a binary stream follows the envelope on the wire
	pub has_data: bool,
}

impl<B: Default> Response<B> {
	pub fn ok() -> Self {
		Self {
			code: 0,
			message: String::new(),
			body: B::default(),
			has_data: false,
		}
	}

	pub fn error(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
			body: B::default(),
			has_data: false,
		}
	}
}

impl<B> Response<B> {
	pub fn with_body(mut self, body: B) -> Self {
		self.body = body;
		self
	}

	pub fn is_ok(&self) -> bool {
		self.code == 0
	}
}

/// Binary payload attached to an outgoing request or response
#[derive(Debug)]
pub enum BinarySource {
	Buf(Vec<u8>),
	File {
		path: PathBuf,
		/// Skip this many bytes at the start of the file
		offset: u64,
		/// Unlink the file once it has been streamed out (used for
		/// hardlink fan-out)
		remove_on_close: bool,
	},
}

impl BinarySource {
	pub fn from_file(path: PathBuf) -> Self {
		BinarySource::File {
			path,
			offset: 0,
			remove_on_close: false,
		}
	}
}
