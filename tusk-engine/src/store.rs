//! Offset-tracked payload storage for in-flight uploads

use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tusk_core::*;

use crate::locks::LockTable;
use crate::paths::{PathResolver, UploadPaths};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Durable, lock-guarded chunk storage
///
/// Every upload owns a working directory holding a payload preallocated to
/// the declared size and a JSON sidecar with the durable offset. Cloning is
/// cheap and clones share the same lock table.
#[derive(Clone)]
pub struct UploadStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    resolver: PathResolver,
    locks: LockTable,
    max_file_size: u64,
}

impl UploadStore {
    /// Create a store rooted at the resolver's base directory
    pub fn new(resolver: PathResolver, max_file_size: u64) -> Result<Self> {
        fs::create_dir_all(resolver.base())?;

        Ok(UploadStore {
            inner: Arc::new(StoreInner {
                resolver,
                locks: LockTable::new(),
                max_file_size,
            }),
        })
    }

    /// Create a store from configuration
    pub fn open(config: &UploadConfig) -> Result<Self> {
        let resolver = PathResolver::for_environment(config.environment, config.base_dir.as_deref());
        Self::new(resolver, config.max_file_size)
    }

    /// Create temporary store for testing
    #[cfg(any(test, feature = "test-utils"))]
    pub fn temp() -> Result<(Self, tempfile::TempDir)> {
        let temp_dir = tempfile::tempdir()?;
        let store = Self::new(
            PathResolver::new(temp_dir.path().join("uploads")),
            DEFAULT_MAX_FILE_SIZE,
        )?;
        Ok((store, temp_dir))
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.inner.resolver
    }

    pub fn max_file_size(&self) -> u64 {
        self.inner.max_file_size
    }

    /// Create the working directory, preallocated payload and sidecar
    pub fn initiate_upload(&self, id: &UploadId, size: u64, metadata: Metadata) -> Result<UploadInfo> {
        self.initiate_upload_with_expiry(id, size, metadata, None)
    }

    /// Like [`initiate_upload`](Self::initiate_upload), recording when the session expires
    pub fn initiate_upload_with_expiry(
        &self,
        id: &UploadId,
        size: u64,
        metadata: Metadata,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UploadInfo> {
        if size == 0 {
            return Err(TuskError::Validation("upload size must be positive".to_string()));
        }
        if size > self.inner.max_file_size {
            return Err(TuskError::Validation(format!(
                "upload size {} exceeds maximum of {} bytes",
                size, self.inner.max_file_size
            )));
        }

        let entry = self.inner.locks.entry(id)?;
        let guard = entry.lock()?;
        let paths = self.inner.resolver.resolve(id);

        if paths.dir.exists() {
            return Err(TuskError::Validation(format!("upload {} already exists", id)));
        }

        let mut info = UploadInfo::new(id.clone(), size, metadata);
        info.expires_at = expires_at;

        let created = fs::create_dir_all(&paths.dir)
            .map_err(TuskError::from)
            .and_then(|_| {
                let payload = File::create(&paths.payload)?;
                payload.set_len(size)?;
                payload.sync_all()?;
                write_info(&paths, &info)
            });

        if let Err(e) = created {
            warn!("Failed to initiate upload {}: {}", id, e);
            let _ = fs::remove_dir_all(&paths.dir);
            drop(guard);
            self.inner.locks.release(id)?;
            return Err(e);
        }

        info!("Initiated upload {} ({} bytes)", id, size);
        Ok(info)
    }

    /// Write bytes from `reader` at `offset`, returning `offset + bytes written`
    ///
    /// At most `size - offset` bytes are consumed. The sidecar offset only
    /// advances once the bytes are synced; a failed write reports how far it
    /// got through [`TuskError::ChunkWrite`] and leaves the durable offset
    /// untouched.
    pub fn write_chunk<R: Read>(&self, id: &UploadId, offset: u64, reader: R) -> Result<u64> {
        self.write_locked(id, offset, false, reader)
    }

    /// Write a chunk only if `offset` is the durable offset
    ///
    /// The comparison happens under the upload's lock, so of two writers
    /// claiming the same offset exactly one succeeds and the other gets
    /// [`TuskError::Conflict`] carrying the winner's new offset.
    pub fn append_chunk<R: Read>(&self, id: &UploadId, offset: u64, reader: R) -> Result<u64> {
        self.write_locked(id, offset, true, reader)
    }

    fn write_locked<R: Read>(&self, id: &UploadId, offset: u64, exact: bool, reader: R) -> Result<u64> {
        let entry = self.inner.locks.entry(id)?;
        let _guard = entry.lock()?;
        let paths = self.inner.resolver.resolve(id);

        let mut info = read_info(&paths, id)?;
        if exact && offset != info.offset {
            return Err(TuskError::Conflict {
                client_offset: offset,
                server_offset: info.offset,
            });
        }
        if offset > info.size {
            return Err(TuskError::Validation(format!(
                "offset {} is beyond upload size {}",
                offset, info.size
            )));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&paths.payload)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => TuskError::not_found(id.as_str()),
                _ => TuskError::Io(e),
            })?;

        let mut limited = reader.take(info.size - offset);
        let mut written = 0u64;
        let outcome = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| copy_counted(&mut limited, &mut file, &mut written))
            .and_then(|_| file.sync_data());

        if let Err(source) = outcome {
            warn!(
                "Chunk write for {} failed at offset {} after {} bytes: {}",
                id,
                offset + written,
                written,
                source
            );
            return Err(TuskError::ChunkWrite {
                offset: offset + written,
                written,
                source,
            });
        }

        let new_offset = offset + written;
        info.offset = info.offset.max(new_offset);
        info.updated_at = Utc::now();
        write_info(&paths, &info)?;

        debug!("Wrote {} bytes to {} at offset {}, now at {}/{}", written, id, offset, info.offset, info.size);
        Ok(new_offset)
    }

    /// Read the sidecar record
    pub fn get_info(&self, id: &UploadId) -> Result<UploadInfo> {
        read_info(&self.inner.resolver.resolve(id), id)
    }

    pub fn exists(&self, id: &UploadId) -> bool {
        self.inner.resolver.resolve(id).info.exists()
    }

    pub fn is_complete(&self, id: &UploadId) -> Result<bool> {
        Ok(self.get_info(id)?.is_complete())
    }

    pub fn get_progress(&self, id: &UploadId) -> Result<f64> {
        Ok(self.get_info(id)?.progress())
    }

    /// Merge keys into the stored metadata
    pub fn update_metadata(&self, id: &UploadId, metadata: Metadata) -> Result<UploadInfo> {
        self.update_metadata_checked(id, metadata, |_| Ok(()))
    }

    /// Merge keys, persisting only if `check` accepts the merged map
    ///
    /// `check` runs under the upload's lock, so no concurrent update can
    /// slip in between validation and the write.
    pub fn update_metadata_checked<F>(&self, id: &UploadId, metadata: Metadata, check: F) -> Result<UploadInfo>
    where
        F: FnOnce(&Metadata) -> Result<()>,
    {
        let entry = self.inner.locks.entry(id)?;
        let _guard = entry.lock()?;
        let paths = self.inner.resolver.resolve(id);

        let mut info = read_info(&paths, id)?;
        info.metadata.extend(metadata);
        check(&info.metadata)?;
        info.updated_at = Utc::now();
        write_info(&paths, &info)?;

        Ok(info)
    }

    /// Move the payload to `dest` and remove the working directory
    ///
    /// Returns the record as it was just before removal. Calling this twice
    /// fails with `NotFound` the second time.
    pub fn finalize_upload(&self, id: &UploadId, dest: impl AsRef<Path>) -> Result<UploadInfo> {
        let dest = dest.as_ref();
        let entry = self.inner.locks.entry(id)?;
        let guard = entry.lock()?;
        let paths = self.inner.resolver.resolve(id);

        if !paths.payload.exists() {
            drop(guard);
            self.inner.locks.release(id)?;
            return Err(TuskError::not_found(id.as_str()));
        }

        let info = read_info(&paths, id)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        move_file(&paths.payload, dest)?;
        remove_dir_if_present(&paths.dir)?;

        drop(guard);
        self.inner.locks.release(id)?;

        info!("Finalized upload {} to {}", id, dest.display());
        Ok(info)
    }

    /// Delete all working state for an upload; absent state is not an error
    pub fn terminate(&self, id: &UploadId) -> Result<()> {
        let entry = self.inner.locks.entry(id)?;
        let guard = entry.lock()?;
        let paths = self.inner.resolver.resolve(id);

        remove_dir_if_present(&paths.dir)?;

        drop(guard);
        self.inner.locks.release(id)?;

        info!("Terminated upload {}", id);
        Ok(())
    }

    /// Every readable sidecar under the working root, oldest first
    pub fn list_uploads(&self) -> Result<Vec<UploadInfo>> {
        let base = self.inner.resolver.base();
        let entries = match fs::read_dir(base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut uploads = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| UploadId::new(n).ok()) else {
                debug!("Skipping foreign directory {}", entry.path().display());
                continue;
            };

            match self.get_info(&id) {
                Ok(info) => uploads.push(info),
                Err(e) => warn!("Skipping unreadable upload {}: {}", id, e),
            }
        }

        uploads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(uploads)
    }

    /// Drop lock entries older than `ttl` that are not in use
    pub fn sweep_locks(&self, ttl: Duration) -> Result<usize> {
        self.inner.locks.sweep(ttl)
    }

    pub fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }

    /// Location of an upload's working state
    pub fn paths(&self, id: &UploadId) -> UploadPaths {
        self.inner.resolver.resolve(id)
    }
}

fn read_info(paths: &UploadPaths, id: &UploadId) -> Result<UploadInfo> {
    let raw = fs::read(&paths.info).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => TuskError::not_found(id.as_str()),
        _ => TuskError::Io(e),
    })?;
    let info = serde_json::from_slice(&raw).map_err(TuskError::Serialization)?;
    Ok(info)
}

/// Replace the sidecar atomically: write a temp file, sync, rename over
fn write_info(paths: &UploadPaths, info: &UploadInfo) -> Result<()> {
    let tmp = paths.info.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(info).map_err(TuskError::Serialization)?;

    let mut file = File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    fs::rename(&tmp, &paths.info)?;

    Ok(())
}

fn copy_counted<R: Read, W: Write>(reader: &mut R, writer: &mut W, written: &mut u64) -> io::Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        *written += n as u64;
    }
}

/// Rename, falling back to copy + delete when crossing filesystems
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Rename {} -> {} failed ({}), copying instead", from.display(), to.display(), e);
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
