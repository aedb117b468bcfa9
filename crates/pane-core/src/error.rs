//! Error types for the wire codec and request handling.

use thiserror::Error;

/// Decode failure for a framed wire payload.
///
/// Decoding is all-or-nothing: a failed decode leaves no partial state
/// behind, the caller simply drops the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of payload")]
    UnexpectedEnd,
    #[error("invalid tag: {0}")]
    InvalidTag(u8),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    /// Requests and responses travel as JSON only.
    #[error("{0} messages must be encoded as JSON")]
    JsonOnly(&'static str),
}

/// A well-formed request that could not be satisfied.
///
/// The message text travels verbatim in `Response::message`, so the
/// constructors below pin the exact strings clients match on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CommandError {
    pub message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn session_not_found() -> Self {
        Self::new("session not found")
    }

    pub fn session_id_required() -> Self {
        Self::new("session id required")
    }

    pub fn create_failed() -> Self {
        Self::new("create session failed")
    }

    pub fn invalid_request() -> Self {
        Self::new("invalid request")
    }

    pub fn no_running_sessions() -> Self {
        Self::new("no running sessions (specify session id)")
    }

    pub fn multiple_running_sessions() -> Self {
        Self::new("multiple running sessions (specify session id)")
    }
}
