//! Error types for chunkdex.

use thiserror::Error;

/// Result type alias using ChunkdexError.
pub type Result<T> = std::result::Result<T, ChunkdexError>;

/// Errors that can occur in chunk index operations.
#[derive(Debug, Error)]
pub enum ChunkdexError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Space management errors
    #[error("Allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: u64, reason: String },

    // Index errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Index already created: {0}")]
    AlreadyCreated(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    // Corruption errors
    #[error("Corrupt structure: {0}")]
    Corrupt(String),

    #[error("Checksum mismatch at address {addr}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { addr: u64, expected: u32, actual: u32 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChunkdexError {
    /// Returns true if the error means on-disk data failed validation.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ChunkdexError::Corrupt(_) | ChunkdexError::ChecksumMismatch { .. }
        )
    }

    /// Shorthand for building a `Corrupt` error.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        ChunkdexError::Corrupt(reason.into())
    }

    /// Shorthand for building an `Internal` error.
    pub fn internal(reason: impl Into<String>) -> Self {
        ChunkdexError::Internal(reason.into())
    }
}
