//! Session repositories consulted by the cleanup daemon
//!
//! A repository owns the authoritative status of uploads in one domain
//! (projects, course modules, ...). The daemon only needs to find sessions
//! that expired or went idle and record what it did with them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use tusk_core::*;
use tusk_engine::UploadStore;

#[async_trait]
pub trait UploadRepository: Send + Sync {
    /// Short name used in logs and cycle reports
    fn domain(&self) -> &str;

    /// Non-terminal sessions whose `expires_at` is at or before `now`
    async fn expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionRecord>>;

    /// Sessions currently receiving data
    async fn active_sessions(&self) -> Result<Vec<SessionRecord>>;

    async fn update_status(&self, id: &UploadId, status: UploadStatus) -> Result<()>;

    async fn delete(&self, id: &UploadId) -> Result<()>;
}

/// In-process repository keyed by upload id
#[derive(Debug)]
pub struct MemoryRepository {
    domain: String,
    records: Mutex<HashMap<UploadId, SessionRecord>>,
}

impl MemoryRepository {
    pub fn new(domain: impl Into<String>) -> Self {
        MemoryRepository {
            domain: domain.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<UploadId, SessionRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a record
    pub fn insert(&self, record: SessionRecord) {
        self.records().insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &UploadId) -> Option<SessionRecord> {
        self.records().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

#[async_trait]
impl UploadRepository for MemoryRepository {
    fn domain(&self) -> &str {
        &self.domain
    }

    async fn expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionRecord>> {
        let mut expired: Vec<_> = self
            .records()
            .values()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| r.expires_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(expired)
    }

    async fn active_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut active: Vec<_> = self
            .records()
            .values()
            .filter(|r| r.status == UploadStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(active)
    }

    async fn update_status(&self, id: &UploadId, status: UploadStatus) -> Result<()> {
        let mut records = self.records();
        let record = records
            .get_mut(id)
            .ok_or_else(|| TuskError::not_found(id.as_str()))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &UploadId) -> Result<()> {
        self.records().remove(id);
        Ok(())
    }
}

/// Repository derived from the store's own sidecar records
///
/// Every unfinished sidecar counts as an active session. Statuses are not
/// persisted: reclaiming a session removes its sidecar, which is all the
/// state this repository has.
#[derive(Clone)]
pub struct SidecarRepository {
    store: UploadStore,
}

impl SidecarRepository {
    pub fn new(store: UploadStore) -> Self {
        SidecarRepository { store }
    }

    async fn sidecars(&self) -> Result<Vec<UploadInfo>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list_uploads())
            .await
            .map_err(|e| TuskError::Internal(format!("sidecar scan failed: {}", e)))?
    }
}

fn record_for(info: &UploadInfo) -> SessionRecord {
    let record =
        SessionRecord::new(info.id.clone(), UploadStatus::Active).with_updated_at(info.updated_at);
    match info.expires_at {
        Some(at) => record.with_expiry(at),
        None => record,
    }
}

#[async_trait]
impl UploadRepository for SidecarRepository {
    fn domain(&self) -> &str {
        "sidecar"
    }

    async fn expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionRecord>> {
        Ok(self
            .sidecars()
            .await?
            .iter()
            .filter(|info| info.is_expired(now))
            .map(record_for)
            .collect())
    }

    async fn active_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self
            .sidecars()
            .await?
            .iter()
            .filter(|info| !info.is_complete())
            .map(record_for)
            .collect())
    }

    async fn update_status(&self, id: &UploadId, status: UploadStatus) -> Result<()> {
        debug!("Sidecar session {} marked {}", id, status);
        Ok(())
    }

    async fn delete(&self, id: &UploadId) -> Result<()> {
        let store = self.store.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || store.terminate(&id))
            .await
            .map_err(|e| TuskError::Internal(format!("sidecar delete failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn id(s: &str) -> UploadId {
        UploadId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_memory_expired_skips_terminal_records() {
        let repo = MemoryRepository::new("projects");
        let past = Utc::now() - Duration::hours(1);

        repo.insert(SessionRecord::new(id("old"), UploadStatus::Active).with_expiry(past));
        repo.insert(SessionRecord::new(id("done"), UploadStatus::Completed).with_expiry(past));
        repo.insert(
            SessionRecord::new(id("later"), UploadStatus::Pending)
                .with_expiry(Utc::now() + Duration::hours(1)),
        );
        repo.insert(SessionRecord::new(id("forever"), UploadStatus::Active));

        let expired = repo.expired_sessions(Utc::now()).await.unwrap();
        let ids: Vec<_> = expired.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);
    }

    #[tokio::test]
    async fn test_memory_update_status() {
        let repo = MemoryRepository::new("modules");
        repo.insert(SessionRecord::new(id("a"), UploadStatus::Active));

        repo.update_status(&id("a"), UploadStatus::Failed).await.unwrap();
        assert_eq!(repo.get(&id("a")).unwrap().status, UploadStatus::Failed);
        assert!(repo.active_sessions().await.unwrap().is_empty());

        let err = repo.update_status(&id("missing"), UploadStatus::Failed).await.unwrap_err();
        assert!(err.is_not_found());

        repo.delete(&id("a")).await.unwrap();
        repo.delete(&id("a")).await.unwrap();
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_sidecar_sessions_follow_store() {
        let (store, _temp) = UploadStore::temp().unwrap();
        let repo = SidecarRepository::new(store.clone());

        let past = Utc::now() - Duration::minutes(5);
        store
            .initiate_upload_with_expiry(&id("stale"), 4, Metadata::new(), Some(past))
            .unwrap();
        store.initiate_upload(&id("fresh"), 4, Metadata::new()).unwrap();
        store.initiate_upload(&id("full"), 2, Metadata::new()).unwrap();
        store.write_chunk(&id("full"), 0, &b"ok"[..]).unwrap();

        let expired = repo.expired_sessions(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id("stale"));
        assert_eq!(expired[0].expires_at, Some(past));

        let mut active: Vec<_> = repo
            .active_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        active.sort();
        assert_eq!(active, vec!["fresh".to_string(), "stale".to_string()]);

        repo.delete(&id("stale")).await.unwrap();
        assert!(!store.exists(&id("stale")));
    }
}
