//! Error type for the whole gateway, with the classification used by the
//! sync pipeline to decide between retry, revert and abort.
use err_derive::Error;

use crate::data::GatewayId;

#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "IO error: {}", _0)]
	Io(#[error(from)] std::io::Error),

	#[error(display = "Hyper error: {}", _0)]
	Hyper(#[error(from)] hyper::Error),

	#[error(display = "HTTP error: {}", _0)]
	Http(#[error(from)] http::Error),

	#[error(display = "Invalid URI: {}", _0)]
	InvalidUri(#[error(from)] http::uri::InvalidUri),

	#[error(display = "Messagepack encode error: {}", _0)]
	RmpEncode(#[error(from)] rmp_serde::encode::Error),

	#[error(display = "Messagepack decode error: {}", _0)]
	RmpDecode(#[error(from)] rmp_serde::decode::Error),

	#[error(display = "TOML decode error: {}", _0)]
	TomlDecode(#[error(from)] toml::de::Error),

	#[error(display = "RSA error: {}", _0)]
	Rsa(#[error(from)] rsa::Error),

	#[error(display = "Key decode error: {}", _0)]
	Pkcs8(#[error(from)] rsa::pkcs8::Error),

	#[error(display = "Public key decode error: {}", _0)]
	Spki(#[error(from)] rsa::pkcs8::spki::Error),

	#[error(display = "Invalid signature from gateway {}", _0)]
	BadSignature(GatewayId),

	#[error(display = "Unauthorized: {}", _0)]
	Unauthorized(String),

	#[error(display = "Stale metadata")]
	Stale,

	#[error(display = "Operation timed out")]
	Timeout,

	#[error(display = "Operation cancelled")]
	Cancelled,

	#[error(display = "Response too large (limit {} bytes)", _0)]
	TooLarge(usize),

	#[error(display = "Entry already exists")]
	Exists,

	#[error(display = "Entry not found")]
	NotFound,

	#[error(display = "Directory not empty")]
	NotEmpty,

	#[error(display = "Temporarily unavailable, retry later")]
	Busy,

	#[error(display = "Remote returned HTTP status {}", _0)]
	RemoteHttp(u16),

	#[error(display = "Remote IO error: {}", _0)]
	RemoteIo(String),

	#[error(display = "Unsupported operation: {}", _0)]
	Unsupported(&'static str),

	#[error(display = "Invalid request: {}", _0)]
	InvalidRequest(String),

	#[error(display = "{}", _0)]
	Message(String),
}

/// Coarse classification driving retry/revert/abort decisions (and the
/// HTTP status mapping at the front-end boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Safe to retry with backoff
	Transient,
	/// Local view is out of date, retry after a view reload
	Stale,
	/// Signature or permission failure, never retried
	Auth,
	/// Local disk failure, cached data should be considered lost
	LocalIo,
	/// Remote peer failed after all alternatives were tried
	RemoteIo,
	/// Caller misused the protocol
	Misuse,
	Internal,
}

impl Error {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::Timeout | Error::Cancelled | Error::Busy => ErrorKind::Transient,
			Error::Stale => ErrorKind::Stale,
			Error::BadSignature(_) | Error::Unauthorized(_) => ErrorKind::Auth,
			Error::Io(_) => ErrorKind::LocalIo,
			Error::Hyper(_) | Error::RemoteHttp(_) | Error::RemoteIo(_) => ErrorKind::RemoteIo,
			Error::Exists
			| Error::NotFound
			| Error::NotEmpty
			| Error::TooLarge(_)
			| Error::InvalidRequest(_)
			| Error::Unsupported(_) => ErrorKind::Misuse,
			_ => ErrorKind::Internal,
		}
	}

	pub fn is_transient(&self) -> bool {
		matches!(self.kind(), ErrorKind::Transient | ErrorKind::RemoteIo)
	}

	/// Status code used when this error crosses the peer HTTP boundary
	pub fn http_status_code(&self) -> u16 {
		match self {
			Error::InvalidRequest(_) => 400,
			Error::BadSignature(_) | Error::Unauthorized(_) => 403,
			Error::NotFound => 404,
			Error::Exists | Error::Stale => 409,
			Error::TooLarge(_) => 413,
			Error::NotEmpty => 422,
			Error::Busy => 202,
			Error::Timeout => 504,
			_ => 500,
		}
	}
}

pub trait OkOrMessage {
	type S;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<Self::S, Error>;
}

impl<T, E> OkOrMessage for Result<T, E>
where
	E: std::fmt::Display,
{
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Ok(x) => Ok(x),
			Err(e) => Err(Error::Message(format!("{}: {}", message.into(), e))),
		}
	}
}

impl<T> OkOrMessage for Option<T> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		self.ok_or_else(|| Error::Message(message.into()))
	}
}
