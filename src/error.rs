//! Strongly typed error system for the SSE transport.
//!
//! Every failure the transport can surface carries a typed [`ErrorCode`],
//! which is what the client's retry policy keys off: transport-level
//! failures are retryable, protocol and GraphQL-level failures are not.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Typed error codes for compile-time safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Transport errors (retryable)
    NetworkError,
    Timeout,
    ConnectionRefused,
    StreamClosed,
    ParseError,
    ServerError,

    // Protocol errors (terminal)
    BadRequest,
    Unauthorized,
    NotFound,
    MethodNotAllowed,
    Conflict,

    // Local errors
    InvalidUrl,
    InvalidResponse,
    SerializeError,
    DeserializeError,
    RetriesExhausted,
    Disposed,
    InternalError,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::ParseError => "PARSE_ERROR",
            Self::ServerError => "SERVER_ERROR",
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::Conflict => "CONFLICT",
            Self::InvalidUrl => "INVALID_URL",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::SerializeError => "SERIALIZE_ERROR",
            Self::DeserializeError => "DESERIALIZE_ERROR",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
            Self::Disposed => "DISPOSED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns true if the client may retry after this error.
    ///
    /// Transport-level failures (reset, timeout, unexpected EOF, a garbled
    /// stream, 5xx handshake) are retryable; protocol-level rejections and
    /// anything delivered in-band by GraphQL are not.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::Timeout
                | Self::ConnectionRefused
                | Self::StreamClosed
                | Self::ParseError
                | Self::ServerError
        )
    }

    /// Returns true if this maps to a 4xx response.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::BadRequest
                | Self::Unauthorized
                | Self::NotFound
                | Self::MethodNotAllowed
                | Self::Conflict
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport error carried across the client and server engines.
#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct TransportError {
    /// Typed error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

impl TransportError {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    // Convenience constructors

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    /// Creates a timeout error.
    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, "request timed out")
    }

    /// Creates a wire parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    /// Creates a bad-request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Creates a not-found error.
    pub fn not_found(resource: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{} not found", resource))
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// Creates an error for an unexpectedly closed stream.
    pub fn stream_closed() -> Self {
        Self::new(ErrorCode::StreamClosed, "event stream closed unexpectedly")
    }

    /// Creates an invalid-url error.
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidUrl, message)
    }

    /// Creates a serialization error.
    pub fn serialize(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializeError, message)
    }

    /// Creates a deserialization error.
    pub fn deserialize(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeserializeError, message)
    }

    /// Creates the terminal error reported once retries are exhausted.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::new(
            ErrorCode::RetriesExhausted,
            format!("gave up after {} handshake attempts", attempts),
        )
    }

    /// Creates the error delivered to sinks when the owning client is disposed.
    pub fn disposed() -> Self {
        Self::new(ErrorCode::Disposed, "client disposed")
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Returns true if the client may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// Type alias for transport results.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_properties() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::StreamClosed.is_retryable());
        assert!(ErrorCode::ServerError.is_retryable());
        assert!(!ErrorCode::Conflict.is_retryable());
        assert!(!ErrorCode::NotFound.is_retryable());

        assert!(ErrorCode::Conflict.is_client_error());
        assert!(!ErrorCode::InternalError.is_client_error());
    }

    #[test]
    fn test_error_construction() {
        let err = TransportError::not_found("reservation");
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("reservation"));

        let err = TransportError::retries_exhausted(6);
        assert_eq!(err.code, ErrorCode::RetriesExhausted);
        assert!(err.message.contains('6'));
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::network("connection reset");
        let text = err.to_string();
        assert!(text.contains("NETWORK_ERROR"));
        assert!(text.contains("connection reset"));
    }
}
