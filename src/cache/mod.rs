//! Image cache
//!
//! Maps fingerprints to built images. Entries are keyed by the content
//! fingerprint, so an unchanged spec always finds its image and a changed
//! spec never does.
//!
//! # Entry States
//!
//! | State | Store | Description |
//! |-------|-------|-------------|
//! | Miss | no entry, no lease | Nothing built yet |
//! | Building | lease held | A build is running (here or in another process) |
//! | Complete | entry present | Image built; entry is never rewritten |
//!
//! A lease that outlives its TTL belongs to a crashed builder and is taken over.

pub mod fs;
pub mod lockfile;
pub mod memory;

pub use fs::FsCacheStore;
pub use lockfile::LockStore;
pub use memory::MemoryCacheStore;

use crate::error::{UvImageError, UvImageResult};
use crate::fingerprint::Fingerprint;
use crate::spec::Platform;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// `repository:tag` reference to a built image
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Reference tagged with the full fingerprint
    pub fn for_fingerprint(repository: &str, fingerprint: &Fingerprint) -> Self {
        Self {
            repository: repository.to_string(),
            tag: fingerprint.to_string(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The tag follows the last ':' that comes after the last '/' (registry ports)
        let slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        match s[slash..].rfind(':') {
            Some(i) if slash + i > 0 && slash + i + 1 < s.len() => Ok(Self {
                repository: s[..slash + i].to_string(),
                tag: s[slash + i + 1..].to_string(),
            }),
            _ => Err(format!("invalid image reference '{}'", s)),
        }
    }
}

impl TryFrom<String> for ImageReference {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageReference> for String {
    fn from(value: ImageReference) -> Self {
        value.to_string()
    }
}

/// Record of a successfully built image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCacheEntry {
    pub fingerprint: Fingerprint,
    pub image: ImageReference,
    pub built_at: DateTime<Utc>,
    pub resolver_version: String,
    pub builder_version: String,
    pub platform: Platform,
}

/// Exclusive right to build one fingerprint, released on drop
pub struct Lease {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
    renew: Option<Box<dyn Fn(Duration) -> bool + Send + Sync>>,
}

impl Lease {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
            renew: None,
        }
    }

    /// Attach the store's way of pushing the expiry forward
    pub fn with_renew(mut self, renew: impl Fn(Duration) -> bool + Send + Sync + 'static) -> Self {
        self.renew = Some(Box::new(renew));
        self
    }

    /// Extend the lease to expire `ttl` from now.
    ///
    /// Returns false once the lease has been taken over by another owner.
    /// Leases without a renewer never expire and always report true.
    pub fn renew(&self, ttl: Duration) -> bool {
        self.renew.as_ref().map_or(true, |renew| renew(ttl))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Storage for image cache entries and build leases
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up the entry for a fingerprint
    async fn get(&self, fingerprint: &Fingerprint) -> UvImageResult<Option<ImageCacheEntry>>;

    /// Durably record an entry; visible to `get` once this returns
    async fn put(&self, entry: &ImageCacheEntry) -> UvImageResult<()>;

    /// Try once to take the build lease for a fingerprint.
    ///
    /// Returns `None` while another live owner holds it. Leases not renewed
    /// within `ttl` are considered abandoned and taken over.
    async fn acquire_lease(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> UvImageResult<Option<Lease>>;

    /// All entries, oldest first
    async fn list(&self) -> UvImageResult<Vec<ImageCacheEntry>>;

    /// Get the human-readable store name for display
    fn store_name(&self) -> &'static str;
}

/// Write a file so readers see either the old content or the complete new content.
///
/// Data goes to a temporary sibling, is fsynced, then renamed into place.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> UvImageResult<()> {
    use tokio::io::AsyncWriteExt;

    let parent = path
        .parent()
        .ok_or_else(|| UvImageError::Internal(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| UvImageError::io(format!("creating {}", parent.display()), e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| UvImageError::io(format!("creating {}", tmp.display()), e))?;
    file.write_all(content)
        .await
        .map_err(|e| UvImageError::io(format!("writing {}", tmp.display()), e))?;
    file.sync_all()
        .await
        .map_err(|e| UvImageError::io(format!("syncing {}", tmp.display()), e))?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(UvImageError::io(format!("renaming into {}", path.display()), e));
    }

    // Persist the rename itself
    #[cfg(unix)]
    {
        if let Ok(dir) = tokio::fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }

    Ok(())
}
