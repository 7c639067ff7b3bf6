//! Per-upload exclusive locks
//!
//! The table's own guard is only held while looking up, inserting or removing
//! entries. Payload I/O happens under the per-upload lock, so a slow upload
//! never blocks lookups for other uploads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tusk_core::{Result, TuskError, UploadId};

/// Lock for one upload id
#[derive(Debug)]
pub struct LockEntry {
    lock: Mutex<()>,
    created_at: Instant,
}

impl LockEntry {
    fn new() -> Self {
        LockEntry {
            lock: Mutex::new(()),
            created_at: Instant::now(),
        }
    }

    /// Block until the upload is exclusively ours
    pub fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| TuskError::Internal("upload lock poisoned".to_string()))
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[derive(Debug, Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, Arc<LockEntry>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<LockEntry>>>> {
        self.entries
            .lock()
            .map_err(|_| TuskError::Internal("lock table poisoned".to_string()))
    }

    /// Get the lock for an upload, creating it on first use
    pub fn entry(&self, id: &UploadId) -> Result<Arc<LockEntry>> {
        let mut table = self.table()?;
        let entry = table
            .entry(id.as_str().to_string())
            .or_insert_with(|| Arc::new(LockEntry::new()));
        Ok(Arc::clone(entry))
    }

    /// Drop the entry for an upload that no longer exists
    ///
    /// The entry stays while anyone besides the table and the releasing
    /// caller still holds it, so waiters keep sharing one mutex with
    /// whoever touches the id next.
    pub fn release(&self, id: &UploadId) -> Result<bool> {
        let mut table = self.table()?;
        match table.get(id.as_str()) {
            Some(entry) if Arc::strong_count(entry) <= 2 => {
                table.remove(id.as_str());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove entries at least `ttl` old that nobody is holding or waiting on
    pub fn sweep(&self, ttl: Duration) -> Result<usize> {
        let mut table = self.table()?;
        let before = table.len();
        // strong_count == 1 means only the table references the entry
        table.retain(|_, entry| Arc::strong_count(entry) > 1 || entry.age() < ttl);
        Ok(before - table.len())
    }

    pub fn len(&self) -> usize {
        self.table().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
