//! Error types for editrpc

use std::time::Duration;

use thiserror::Error;

use crate::protocol::message::{ResponseError, error_codes};

pub type EditRpcResult<T> = std::result::Result<T, EditRpcError>;

#[derive(Debug, Error)]
pub enum EditRpcError {
    #[error("{0}")]
    Framing(#[from] FramingError),

    #[error("{0}")]
    Output(#[from] OutputError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Peer(#[from] PeerError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Stream-level corruption; the connection is torn down.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("Malformed header line: {0}")]
    InvalidHeader(String),

    #[error("Stream closed inside a header block")]
    UnexpectedEof,

    #[error("Stream closed before {expected} body bytes were read")]
    Truncated { expected: usize },

    #[error("Content-Length {length} exceeds the {limit} byte limit")]
    TooLarge { length: usize, limit: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Handler {handler} has no method name")]
    MissingMethod { handler: &'static str },

    #[error("Unknown registration token: {0}")]
    UnknownToken(u64),
}

/// Failure returned from a handler body
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Content modified")]
    ContentModified,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Rpc(ResponseError),
}

impl HandlerError {
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    pub fn error_code(&self) -> i32 {
        match self {
            Self::InvalidParams(_) => error_codes::INVALID_PARAMS,
            Self::Cancelled => error_codes::REQUEST_CANCELLED,
            Self::ContentModified => error_codes::CONTENT_MODIFIED,
            Self::Internal(_) => error_codes::INTERNAL_ERROR,
            Self::Rpc(err) => err.code,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Rpc(err) => err.is_cancelled(),
            _ => false,
        }
    }

    /// Wire form of this failure
    pub fn to_response_error(&self) -> ResponseError {
        match self {
            Self::InvalidParams(detail) => ResponseError::invalid_params(detail),
            Self::Cancelled => ResponseError::request_cancelled(),
            Self::ContentModified => ResponseError::content_modified(),
            Self::Internal(detail) => ResponseError::internal_error(detail),
            Self::Rpc(err) => err.clone(),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<ResponseError> for HandlerError {
    fn from(err: ResponseError) -> Self {
        Self::Rpc(err)
    }
}

impl From<PeerError> for HandlerError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Cancelled => Self::Cancelled,
            PeerError::Remote(err) => Self::Rpc(err),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Output writer failure. Cloneable so every waiter observes the same fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputError {
    #[error("Output writer is closed")]
    Closed,

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Serialization failed: {0}")]
    Serialize(String),
}

/// Failure of a request sent to the remote peer
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Peer error {0}")]
    Remote(ResponseError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("{0}")]
    Output(#[from] OutputError),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl PeerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
            || matches!(self, Self::Remote(err) if err.is_cancelled())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_codes() {
        assert_eq!(
            HandlerError::InvalidParams("x".into()).error_code(),
            error_codes::INVALID_PARAMS
        );
        assert_eq!(
            HandlerError::Cancelled.error_code(),
            error_codes::REQUEST_CANCELLED
        );
        assert_eq!(
            HandlerError::ContentModified.error_code(),
            error_codes::CONTENT_MODIFIED
        );
        assert_eq!(
            HandlerError::internal("boom").error_code(),
            error_codes::INTERNAL_ERROR
        );
        assert_eq!(
            HandlerError::Rpc(ResponseError::new(42, "custom")).error_code(),
            42
        );
    }

    #[test]
    fn test_anyhow_becomes_internal() {
        let err: HandlerError = anyhow::anyhow!("disk full").context("saving").into();
        let wire = err.to_response_error();
        assert_eq!(wire.code, error_codes::INTERNAL_ERROR);
        assert!(wire.message.contains("saving"));
        assert!(wire.message.contains("disk full"));
    }

    #[test]
    fn test_cancelled_error() {
        assert!(HandlerError::Cancelled.is_cancelled());
        assert!(HandlerError::Rpc(ResponseError::request_cancelled()).is_cancelled());
        assert!(!HandlerError::ContentModified.is_cancelled());

        assert!(PeerError::Cancelled.is_cancelled());
        assert!(PeerError::Remote(ResponseError::request_cancelled()).is_cancelled());
        assert!(!PeerError::ConnectionClosed.is_cancelled());
    }

    #[test]
    fn test_peer_error_into_handler_error() {
        let err: HandlerError = PeerError::Remote(ResponseError::method_not_found("x")).into();
        assert_eq!(err.error_code(), error_codes::METHOD_NOT_FOUND);

        let err: HandlerError = PeerError::ConnectionClosed.into();
        assert!(matches!(err, HandlerError::Internal(_)));
    }
}
