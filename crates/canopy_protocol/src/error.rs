//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while decoding the push-stream protocol.
///
/// A malformed frame is recoverable: the ingest loop logs and skips it
/// without tearing down the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame bytes were not valid UTF-8 or not `field: value` lines.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame carried an event tag this client does not recognize.
    #[error("unknown event tag: {0}")]
    UnknownEvent(String),

    /// A data-bearing event arrived without a `data` field.
    #[error("missing data for event: {0}")]
    MissingData(String),

    /// The `data` field was not the expected `{path, data}` JSON object.
    #[error("invalid data payload: {0}")]
    InvalidPayload(String),
}
