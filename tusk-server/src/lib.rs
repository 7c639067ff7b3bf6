//! Upload orchestration and background maintenance for tusk
//!
//! [`UploadManager`] is the request-facing entry point; [`CleanupDaemon`]
//! reclaims sessions that expired or stopped making progress, as reported
//! by one or more [`UploadRepository`] implementations.

pub mod cleanup;
pub mod manager;
pub mod repository;

pub use cleanup::*;
pub use manager::*;
pub use repository::*;
