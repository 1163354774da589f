//! On-disk cache store
//!
//! Layout under the cache directory:
//!
//! ```text
//! entries/<fingerprint>.json   one ImageCacheEntry per built image
//! leases/<fingerprint>.lease   present while a build is running
//! ```
//!
//! Lease files are created with `O_EXCL`, so two processes can never both
//! believe they hold the same lease. Each records an owner id and expiry;
//! expired leases are removed and re-created by the next builder.

use super::{write_atomic, CacheStore, ImageCacheEntry, Lease};
use crate::error::{UvImageError, UvImageResult};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Contents of a lease file
#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    owner: String,
    pid: u32,
    expires_at: DateTime<Utc>,
}

/// Cache store backed by JSON files
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn leases_dir(&self) -> PathBuf {
        self.root.join("leases")
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.entries_dir().join(format!("{}.json", fingerprint))
    }

    fn lease_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.leases_dir().join(format!("{}.lease", fingerprint))
    }
}

/// Create the lease file exclusively; `Ok(false)` if it already exists
fn create_lease_file(path: &Path, record: &LeaseRecord) -> UvImageResult<bool> {
    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(UvImageError::io(format!("creating lease {}", path.display()), e)),
    };

    let content = serde_json::to_vec(record)?;
    file.write_all(&content)
        .and_then(|_| file.sync_all())
        .map_err(|e| UvImageError::io(format!("writing lease {}", path.display()), e))?;
    Ok(true)
}

/// Read a lease file; `None` if missing or unreadable
fn read_lease(path: &Path) -> Option<LeaseRecord> {
    let content = std::fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

/// Push the expiry of a lease forward if `owner` still holds it.
///
/// The record is replaced by rename, so readers never see a partial file.
fn renew_lease_file(path: &Path, owner: &str, ttl: Duration) -> bool {
    let Some(mut record) = read_lease(path).filter(|r| r.owner == owner) else {
        return false;
    };
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    record.expires_at = Utc::now() + ttl;

    let tmp = path.with_extension(format!("lease.{}", owner));
    let renewed = serde_json::to_vec(&record)
        .ok()
        .and_then(|content| std::fs::write(&tmp, content).ok())
        .and_then(|_| std::fs::rename(&tmp, path).ok())
        .is_some();
    if !renewed {
        warn!("Could not renew build lease {}", path.display());
        let _ = std::fs::remove_file(&tmp);
    }
    renewed
}

/// Grace period for a lease file whose owner has not finished writing it
const LEASE_WRITE_GRACE: Duration = Duration::from_secs(5);

fn recently_modified(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age < LEASE_WRITE_GRACE)
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, fingerprint: &Fingerprint) -> UvImageResult<Option<ImageCacheEntry>> {
        let path = self.entry_path(fingerprint);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UvImageError::io(format!("reading {}", path.display()), e)),
        };
        let entry: ImageCacheEntry = serde_json::from_slice(&content)?;
        if entry.fingerprint != *fingerprint {
            return Err(UvImageError::Internal(format!(
                "cache entry {} records fingerprint {}",
                path.display(),
                entry.fingerprint
            )));
        }
        Ok(Some(entry))
    }

    async fn put(&self, entry: &ImageCacheEntry) -> UvImageResult<()> {
        let path = self.entry_path(&entry.fingerprint);
        let content = serde_json::to_vec_pretty(entry)?;
        write_atomic(&path, &content).await?;
        debug!("Cached {} at {}", entry.image, path.display());
        Ok(())
    }

    async fn acquire_lease(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> UvImageResult<Option<Lease>> {
        let dir = self.leases_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| UvImageError::io(format!("creating {}", dir.display()), e))?;

        let path = self.lease_path(fingerprint);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| UvImageError::Internal(format!("lease TTL out of range: {}", e)))?;
        let record = LeaseRecord {
            owner: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            expires_at: Utc::now() + ttl,
        };

        // One takeover attempt: a stale lease is removed, then we race for it again
        for _ in 0..2 {
            if create_lease_file(&path, &record)? {
                let owner = record.owner.clone();
                let lease_path = path.clone();
                let renew_owner = record.owner.clone();
                let renew_path = path.clone();
                let lease = Lease::new(move || {
                    // Only remove the file if it is still ours
                    if read_lease(&lease_path).is_some_and(|r| r.owner == owner) {
                        let _ = std::fs::remove_file(&lease_path);
                    }
                })
                .with_renew(move |ttl| renew_lease_file(&renew_path, &renew_owner, ttl));
                return Ok(Some(lease));
            }

            match read_lease(&path) {
                Some(existing) if existing.expires_at > Utc::now() => return Ok(None),
                Some(existing) => warn!(
                    "Taking over expired build lease for {} (pid {})",
                    fingerprint.short(),
                    existing.pid
                ),
                None if recently_modified(&path) => return Ok(None),
                None => warn!("Removing unreadable build lease {}", path.display()),
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(UvImageError::io(format!("removing lease {}", path.display()), e))
                }
            }
        }

        Ok(None)
    }

    async fn list(&self) -> UvImageResult<Vec<ImageCacheEntry>> {
        let dir = self.entries_dir();
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UvImageError::io(format!("reading {}", dir.display()), e)),
        };

        let mut entries = Vec::new();
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|e| UvImageError::io(format!("reading {}", dir.display()), e))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read(&path)
                .await
                .map_err(|e| UvImageError::io(format!("reading {}", path.display()), e))?;
            match serde_json::from_slice::<ImageCacheEntry>(&content) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping unreadable cache entry {}: {}", path.display(), e),
            }
        }

        entries.sort_by(|a, b| a.built_at.cmp(&b.built_at));
        Ok(entries)
    }

    fn store_name(&self) -> &'static str {
        "local"
    }
}
