//! Module containing error types used in Ringstore

use err_derive::Error;
use std::io;

use crate::key::Key;

/// Errors of this crate
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] io::Error),

	#[error(display = "Messagepack encode error: {}", _0)]
	RmpEncode(#[error(source)] rmp_serde::encode::Error),
	#[error(display = "Messagepack decode error: {}", _0)]
	RmpDecode(#[error(source)] rmp_serde::decode::Error),
	#[error(display = "JSON error: {}", _0)]
	Json(#[error(source)] serde_json::error::Error),
	#[error(display = "Invalid configuration file: {}", _0)]
	TomlDecode(#[error(source)] toml::de::Error),

	#[error(display = "Timeout")]
	Timeout,

	#[error(display = "No data found for key {:?}", _0)]
	NoData(Key),

	#[error(display = "Invalid data block: {}", _0)]
	InvalidDataBlock(String),

	#[error(display = "Data block is already saved with a newer timestamp")]
	OldDataDetected,

	#[error(display = "Permission denied: {}", _0)]
	PermissionDenied(String),

	#[error(display = "No free space: {}", _0)]
	NoFreeSpace(String),

	#[error(display = "No free user space: {}", _0)]
	MdNoFreeSpace(String),

	#[error(display = "User metadata is not initialized")]
	MdNotInitialized,

	#[error(display = "Already exists: {}", _0)]
	AlreadyExists(String),

	#[error(display = "Not found: {}", _0)]
	NotFound(String),

	#[error(display = "Range conflict: {}", _0)]
	RangeConflict(String),

	#[error(display = "Transport error: {}", _0)]
	Transport(String),

	#[error(display = "Remote error [{}]: {}", _0, _1)]
	Remote(i64, String),

	#[error(display = "{}", _0)]
	Message(String),
}

impl Error {
	/// True for errors that data-path callers are expected to recover from
	/// by retrying another replica
	pub fn is_recoverable(&self) -> bool {
		matches!(
			self,
			Error::NoData(_) | Error::NotFound(_) | Error::Transport(_) | Error::Timeout
		)
	}
}

impl From<tokio::sync::watch::error::RecvError> for Error {
	fn from(e: tokio::sync::watch::error::RecvError) -> Error {
		Error::Message(format!("Watch channel error: {}", e))
	}
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
	fn from(_e: tokio::sync::mpsc::error::SendError<T>) -> Error {
		Error::Message("MPSC send error".into())
	}
}

impl From<tokio::task::JoinError> for Error {
	fn from(e: tokio::task::JoinError) -> Error {
		Error::Message(format!("Task join error: {}", e))
	}
}

/// Trait to map error to the Bad Request error code
pub trait OkOrMessage {
	type S2;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Self::S2;
}

impl<T, E> OkOrMessage for Result<T, E>
where
	E: std::fmt::Display,
{
	type S2 = Result<T, Error>;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Ok(x) => Ok(x),
			Err(e) => Err(Error::Message(format!("{}: {}", message.into(), e))),
		}
	}
}

impl<T> OkOrMessage for Option<T> {
	type S2 = Result<T, Error>;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Some(x) => Ok(x),
			None => Err(Error::Message(message.into())),
		}
	}
}
