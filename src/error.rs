//! Error types for the chunking and retrieval engine.
//!
//! Empty message content is deliberately absent here: a whitespace-only
//! message is a no-op at the ingestion boundary, not a failure.

use thiserror::Error;

/// Errors raised by the core engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The embedding call failed; nothing was persisted, so the merge is
    /// safe to retry with the same buffered messages.
    #[error("embedding failed: {message}")]
    EmbeddingFailure { message: String, transient: bool },

    /// A vector's dimension disagrees with the rest of the tenant's
    /// collection. Fatal for that tenant's index build or search; never
    /// masked by truncation or padding.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The document store could not be reached or rejected the operation.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The answer generator failed. Surfaced to end users as a generic
    /// "try again" reply, never as internal detail.
    #[error("answer generation failed: {message}")]
    AnswererFailure { message: String, transient: bool },
}

impl EngineError {
    pub fn embedding(message: impl Into<String>, transient: bool) -> Self {
        Self::EmbeddingFailure {
            message: message.into(),
            transient,
        }
    }

    pub fn answerer(message: impl Into<String>, transient: bool) -> Self {
        Self::AnswererFailure {
            message: message.into(),
            transient,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::EmbeddingFailure { transient, .. } => *transient,
            Self::AnswererFailure { transient, .. } => *transient,
            Self::StorageUnavailable(_) => true,
            Self::DimensionMismatch { .. } => false,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

/// Validates that a vector has the expected dimension.
pub fn validate_dimension(expected: usize, actual: usize) -> Result<(), EngineError> {
    if actual == expected {
        Ok(())
    } else {
        Err(EngineError::DimensionMismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_mismatch_is_not_transient() {
        let err = validate_dimension(768, 512).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn storage_errors_are_transient() {
        assert!(EngineError::StorageUnavailable("pool closed".into()).is_transient());
    }

    #[test]
    fn matching_dimension_passes() {
        assert!(validate_dimension(3, 3).is_ok());
    }
}
