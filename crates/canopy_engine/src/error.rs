//! Error types for the replica engine.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the replica engine.
///
/// Normal absence (an unmapped path, a missing record) is never an error;
/// only store I/O failures and corrupted persisted state propagate. Write
/// failures are reported through dispatcher callbacks, not through these.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The local store failed.
    #[error("store error: {0}")]
    Store(#[from] canopy_store::StoreError),

    /// A stream frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] canopy_protocol::ProtocolError),

    /// The persisted path index could not be decoded.
    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    /// A persisted record field could not be decoded.
    #[error("record corrupted at short key {key}: {reason}")]
    RecordCorrupted {
        /// The short key whose record is damaged.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = EngineError::IndexCorrupted("truncated".into());
        assert!(err.to_string().contains("truncated"));

        let err = EngineError::RecordCorrupted {
            key: "a1b2c3d4".into(),
            reason: "unknown kind".into(),
        };
        assert!(err.to_string().contains("a1b2c3d4"));
    }

    #[test]
    fn store_error_conversion() {
        let err: EngineError = canopy_store::StoreError::Closed.into();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
