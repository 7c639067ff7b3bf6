//! Upload subsystem configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 100 MiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Deployment environment, selects default working directories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = crate::TuskError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(crate::TuskError::Validation(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Overrides the environment's default working directory
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Lifetime granted to a new upload session
    #[serde(default = "default_upload_ttl_secs")]
    pub upload_ttl_secs: u64,
    /// Active sessions without progress for this long are abandoned
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Delete expired repository records instead of marking them expired
    #[serde(default)]
    pub purge_expired_records: bool,
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_upload_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_lock_ttl_secs() -> u64 {
    60 * 60
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            environment: Environment::default(),
            base_dir: None,
            max_file_size: default_max_file_size(),
            max_concurrent: default_max_concurrent(),
            upload_ttl_secs: default_upload_ttl_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            purge_expired_records: false,
        }
    }
}

impl UploadConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read(path)?;
        let config = serde_json::from_slice(&raw)?;
        Ok(config)
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Cleanup tick interval; zero falls back to the default since a zero
    /// period would make `tokio::time::interval` panic
    pub fn cleanup_interval(&self) -> Duration {
        if self.cleanup_interval_secs == 0 {
            Duration::from_secs(default_cleanup_interval_secs())
        } else {
            Duration::from_secs(self.cleanup_interval_secs)
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}
