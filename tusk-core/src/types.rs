//! Core data types for tusk

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upload metadata as declared by the client
pub type Metadata = BTreeMap<String, String>;

const MAX_UPLOAD_ID_LEN: usize = 128;

/// Opaque upload identifier
///
/// The id doubles as the name of the upload's working directory, so only
/// ASCII alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UploadId(String);

impl UploadId {
    /// Create a new upload ID with validation
    pub fn new(id: &str) -> crate::Result<Self> {
        if id.is_empty() {
            return Err(crate::TuskError::InvalidUploadId("empty id".to_string()));
        }

        if id.len() > MAX_UPLOAD_ID_LEN {
            return Err(crate::TuskError::InvalidUploadId(format!(
                "id longer than {} characters",
                MAX_UPLOAD_ID_LEN
            )));
        }

        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(crate::TuskError::InvalidUploadId(format!(
                "invalid characters in '{}'",
                id
            )));
        }

        Ok(UploadId(id.to_string()))
    }

    /// Generate a fresh, time-ordered upload ID
    pub fn generate() -> Self {
        UploadId(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for UploadId {
    type Error = crate::TuskError;

    fn try_from(value: String) -> crate::Result<Self> {
        UploadId::new(&value)
    }
}

impl From<UploadId> for String {
    fn from(id: UploadId) -> Self {
        id.0
    }
}

impl std::str::FromStr for UploadId {
    type Err = crate::TuskError;

    fn from_str(s: &str) -> crate::Result<Self> {
        UploadId::new(s)
    }
}

/// Durable per-upload record, persisted next to the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub id: UploadId,
    /// Declared total length in bytes
    pub size: u64,
    /// Bytes durably written
    pub offset: u64,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UploadInfo {
    /// Create a fresh record with nothing written yet
    pub fn new(id: UploadId, size: u64, metadata: Metadata) -> Self {
        let now = Utc::now();
        UploadInfo {
            id,
            size,
            offset: 0,
            metadata,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.size
    }

    /// Percentage of the declared size written so far
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        (self.offset as f64 / self.size as f64) * 100.0
    }

    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.offset)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Session status as tracked by the owning repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Active => "active",
            UploadStatus::Completed => "completed",
            UploadStatus::Cancelled => "cancelled",
            UploadStatus::Expired => "expired",
            UploadStatus::Failed => "failed",
        }
    }

    /// No further transitions happen from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed
                | UploadStatus::Cancelled
                | UploadStatus::Expired
                | UploadStatus::Failed
        )
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repository view of an upload session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: UploadId,
    pub status: UploadStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: UploadId, status: UploadStatus) -> Self {
        SessionRecord {
            id,
            status,
            expires_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Idle longer than the cutoff allows
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.updated_at < cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_progress_never_divides_by_zero() {
        let info = UploadInfo::new(UploadId::new("empty").unwrap(), 0, Metadata::new());
        assert_eq!(info.progress(), 0.0);
        assert!(info.is_complete());
    }

    #[test]
    fn test_progress_and_remaining() {
        let mut info = UploadInfo::new(UploadId::new("half").unwrap(), 200, Metadata::new());
        assert_eq!(info.progress(), 0.0);
        info.offset = 50;
        assert_eq!(info.progress(), 25.0);
        assert_eq!(info.remaining(), 150);
        info.offset = 200;
        assert_eq!(info.progress(), 100.0);
        assert!(info.is_complete());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut info = UploadInfo::new(UploadId::new("exp").unwrap(), 10, Metadata::new());
        assert!(!info.is_expired(now));
        info.expires_at = Some(now - Duration::seconds(1));
        assert!(info.is_expired(now));
    }

    #[test]
    fn test_upload_id_serde_validates() {
        let id: UploadId = serde_json::from_str("\"abc-123\"").unwrap();
        assert_eq!(id.as_str(), "abc-123");
        assert!(serde_json::from_str::<UploadId>("\"../etc\"").is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(!UploadStatus::Active.is_terminal());
        assert!(!UploadStatus::Pending.is_terminal());
        assert!(UploadStatus::Expired.is_terminal());
        assert_eq!(
            serde_json::to_string(&UploadStatus::Failed).unwrap(),
            "\"failed\""
        );
    }
}
