//! Request-scoped upload orchestration
//!
//! The manager validates client input, asks the admission queue for a slot
//! and hands byte-level work to the store. Everything here runs on the
//! caller's thread.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tusk_core::tus;
use tusk_core::*;
use tusk_engine::{Admission, AdmissionQueue, QueuePosition, UploadStore};

/// Client-facing view of admission capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotReport {
    pub available: bool,
    pub queue_length: usize,
    pub has_active: bool,
    pub max_concurrent: usize,
}

#[derive(Clone)]
pub struct UploadManager {
    store: UploadStore,
    queue: Arc<AdmissionQueue>,
    schema: MetadataSchema,
    upload_ttl: Duration,
}

impl UploadManager {
    pub fn new(store: UploadStore, queue: Arc<AdmissionQueue>, schema: MetadataSchema) -> Self {
        UploadManager {
            store,
            queue,
            schema,
            upload_ttl: UploadConfig::default().upload_ttl(),
        }
    }

    /// Build store, queue and manager from configuration
    pub fn from_config(config: &UploadConfig, schema: MetadataSchema) -> Result<Self> {
        let store = UploadStore::open(config)?;
        let queue = Arc::new(AdmissionQueue::new(config.max_concurrent));
        Ok(Self::new(store, queue, schema).with_upload_ttl(config.upload_ttl()))
    }

    pub fn with_upload_ttl(mut self, ttl: Duration) -> Self {
        self.upload_ttl = ttl;
        self
    }

    pub fn store(&self) -> &UploadStore {
        &self.store
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    pub fn schema(&self) -> &MetadataSchema {
        &self.schema
    }

    pub fn validate_metadata(&self, metadata: &Metadata) -> Result<()> {
        self.schema.validate(metadata)
    }

    /// Check a client-declared length, returning it as a byte count
    pub fn validate_file_size(&self, size: i64) -> Result<u64> {
        if size <= 0 {
            return Err(TuskError::Validation(format!(
                "upload size must be positive, got {}",
                size
            )));
        }

        let size = size as u64;
        let max = self.store.max_file_size();
        if size > max {
            return Err(TuskError::Validation(format!(
                "upload size {} exceeds maximum of {} bytes",
                size, max
            )));
        }

        Ok(size)
    }

    /// Compare a client's resume offset with the durable one
    ///
    /// On mismatch the client has to re-query the status and resume from the
    /// server offset carried in the conflict.
    pub fn validate_offset(&self, id: &UploadId, client_offset: u64) -> Result<u64> {
        let server_offset = self.store.get_info(id)?.offset;

        if client_offset != server_offset {
            return Err(TuskError::Conflict {
                client_offset,
                server_offset,
            });
        }

        Ok(server_offset)
    }

    /// When a session created now should expire
    pub fn upload_expiry(&self) -> DateTime<Utc> {
        let now = Utc::now();
        chrono::Duration::from_std(self.upload_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Validate, create the session and request an admission slot
    pub fn initiate_upload(&self, id: &UploadId, size: i64, metadata: Metadata) -> Result<Admission> {
        let size = self.validate_file_size(size)?;
        self.validate_metadata(&metadata)?;

        self.store
            .initiate_upload_with_expiry(id, size, metadata, Some(self.upload_expiry()))?;

        let admission = self.queue.add(id.as_str());
        info!("Upload {} created ({} bytes), admission: {:?}", id, size, admission);
        Ok(admission)
    }

    /// Create a session from raw `Upload-Length` and `Upload-Metadata` values
    pub fn initiate_from_headers(
        &self,
        id: &UploadId,
        upload_length: &str,
        upload_metadata: Option<&str>,
    ) -> Result<Admission> {
        let size = tus::parse_upload_length(upload_length)?;
        let metadata = match upload_metadata {
            Some(header) => tus::parse_metadata_header(header)?,
            None => Metadata::new(),
        };
        self.initiate_upload(id, size, metadata)
    }

    /// Write one chunk at the client's claimed offset
    ///
    /// The offset is compared with the durable one under the upload's lock;
    /// a mismatch fails with `Conflict` and writes nothing.
    pub fn handle_chunk<R: Read>(&self, id: &UploadId, offset: u64, reader: R) -> Result<u64> {
        self.store.append_chunk(id, offset, reader)
    }

    /// `(offset, size)` for client resynchronization
    pub fn get_upload_status(&self, id: &UploadId) -> Result<(u64, u64)> {
        let info = self.store.get_info(id)?;
        Ok((info.offset, info.size))
    }

    pub fn get_upload_info(&self, id: &UploadId) -> Result<UploadInfo> {
        self.store.get_info(id)
    }

    /// Discard the session and free its slot, returning any promoted upload
    pub fn cancel_upload(&self, id: &UploadId) -> Result<Option<String>> {
        self.store.terminate(id)?;
        let promoted = self.queue.finish_upload(id.as_str());
        info!("Upload {} cancelled", id);
        Ok(promoted)
    }

    /// Move a complete upload to `dest` and free its slot
    ///
    /// Returns the upload promoted into the freed slot, if any.
    pub fn finalize_upload(&self, id: &UploadId, dest: impl AsRef<Path>) -> Result<Option<String>> {
        let info = self.store.get_info(id)?;
        if !info.is_complete() {
            return Err(TuskError::Validation(format!(
                "upload {} is incomplete: {} of {} bytes",
                id, info.offset, info.size
            )));
        }

        self.store.finalize_upload(id, dest)?;
        Ok(self.queue.finish_upload(id.as_str()))
    }

    pub fn is_upload_complete(&self, id: &UploadId) -> Result<bool> {
        self.store.is_complete(id)
    }

    pub fn get_upload_progress(&self, id: &UploadId) -> Result<f64> {
        self.store.get_progress(id)
    }

    /// Merge metadata, rejecting updates that would break the schema
    pub fn update_metadata(&self, id: &UploadId, metadata: Metadata) -> Result<UploadInfo> {
        self.store
            .update_metadata_checked(id, metadata, |merged| self.schema.validate(merged))
    }

    pub fn add_to_queue(&self, id: &UploadId) -> Admission {
        self.queue.add(id.as_str())
    }

    pub fn remove_from_queue(&self, id: &UploadId) -> bool {
        self.queue.remove(id.as_str())
    }

    pub fn can_accept_upload(&self) -> bool {
        self.queue.can_accept_upload()
    }

    pub fn is_active_upload(&self, id: &UploadId) -> bool {
        self.queue.is_active(id.as_str())
    }

    pub fn queue_position(&self, id: &UploadId) -> QueuePosition {
        self.queue.queue_position(id.as_str())
    }

    pub fn check_upload_slot(&self) -> SlotReport {
        let snapshot = self.queue.snapshot();
        SlotReport {
            available: snapshot.active.len() < snapshot.max_concurrent,
            queue_length: snapshot.waiting.len(),
            has_active: !snapshot.active.is_empty(),
            max_concurrent: snapshot.max_concurrent,
        }
    }

    /// Terminate every active upload and empty the queue
    ///
    /// Used when the in-memory queue no longer matches reality. Store
    /// failures are logged and do not stop the reset. Returns how many
    /// active uploads were terminated.
    pub fn reset_upload_queue(&self) -> usize {
        let active = self.queue.active_ids();
        let mut terminated = 0;

        for raw in &active {
            let id = match UploadId::new(raw) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Skipping malformed queued id {}: {}", raw, e);
                    continue;
                }
            };
            match self.store.terminate(&id) {
                Ok(()) => terminated += 1,
                Err(e) => warn!("Failed to terminate {} during queue reset: {}", id, e),
            }
        }

        self.queue.clear();
        warn!("Upload queue reset, {} active uploads terminated", terminated);
        terminated
    }

    /// Rebuild the queue from ids that were active before a restart
    pub fn restore_queue<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.queue.load_from(ids);
    }
}
