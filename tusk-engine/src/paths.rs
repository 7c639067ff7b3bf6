//! Working-directory layout for in-flight uploads
//!
//! ```text
//! <base>
//! └── <upload id>
//!     ├── data         preallocated payload
//!     └── info.json    sidecar record
//! ```

use std::path::{Path, PathBuf};
use tusk_core::{Environment, UploadId};

pub const PAYLOAD_FILE: &str = "data";
pub const INFO_FILE: &str = "info.json";

const DEVELOPMENT_BASE: &str = "./uploads/tmp";
const PRODUCTION_BASE: &str = "/var/lib/tusk/uploads";

/// Paths owned by a single upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPaths {
    pub dir: PathBuf,
    pub payload: PathBuf,
    pub info: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    base: PathBuf,
}

impl PathResolver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        PathResolver { base: base.into() }
    }

    /// Pick the working root for an environment unless one is given explicitly
    pub fn for_environment(environment: Environment, base_override: Option<&Path>) -> Self {
        if let Some(base) = base_override {
            return Self::new(base);
        }

        match environment {
            Environment::Development => Self::new(DEVELOPMENT_BASE),
            Environment::Production => Self::new(PRODUCTION_BASE),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Returns the paths of a single upload session,
    /// (e.g. `<base>/<id>`, `<base>/<id>/data`, `<base>/<id>/info.json`).
    pub fn resolve(&self, id: &UploadId) -> UploadPaths {
        let dir = self.base.join(id.as_str());
        UploadPaths {
            payload: dir.join(PAYLOAD_FILE),
            info: dir.join(INFO_FILE),
            dir,
        }
    }
}
