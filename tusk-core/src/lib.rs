//! Core data models and types for tusk

pub mod config;
pub mod error;
pub mod metadata;
pub mod tus;
pub mod types;

pub use config::*;
pub use error::*;
pub use metadata::*;
pub use types::*;

/// Result type alias for tusk operations
pub type Result<T> = std::result::Result<T, TuskError>;
