//! Error types for atom tree operations
//!
//! This module defines all error types used throughout the engine.

use thiserror::Error;

/// Error types for atom tree operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Recognized-but-unsupported or unrecognized major brand
    #[error("Unsupported major brand: {0}")]
    UnsupportedBrand(String),

    /// A structurally required box is absent
    #[error("Required '{0}' atom is missing")]
    MissingRequiredBox(&'static str),

    /// A 64-bit media-data length exceeds the supported ceiling
    #[error("Media data length {0} exceeds the supported ceiling")]
    OversizedAtom(u64),

    /// A child's declared length exceeds its parent's remaining space
    #[error("Corrupt child length: {0}")]
    CorruptChildLength(String),

    /// Pre-write sanity checks failed; nothing was written
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    /// Bad atom path expression
    #[error("Bad atom path: {0}")]
    BadPath(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for atom tree operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::UnsupportedBrand("qt  ".to_string());
        assert!(err.to_string().contains("Unsupported major brand: qt  "));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::IoError(_)));
    }
}
