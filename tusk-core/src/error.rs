//! Error types for tusk

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TuskError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Offset conflict: client offset {client_offset} does not match server offset {server_offset}")]
    Conflict {
        client_offset: u64,
        server_offset: u64,
    },

    #[error("Upload not found: {id}")]
    NotFound { id: String },

    #[error("Invalid upload id: {0}")]
    InvalidUploadId(String),

    #[error("Chunk write failed at offset {offset} after {written} bytes: {source}")]
    ChunkWrite {
        offset: u64,
        written: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TuskError {
    /// Shorthand for an unknown upload.
    pub fn not_found(id: impl Into<String>) -> Self {
        TuskError::NotFound { id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TuskError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, TuskError::Conflict { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, TuskError::Validation(_) | TuskError::InvalidUploadId(_))
    }
}
