//! Persisted lockfiles keyed by fingerprint
//!
//! A resolved graph is written next to the image cache so a rebuild of the
//! same fingerprint (image pruned, memory store restarted) can skip the
//! resolver. A stored lock is only reused when it was produced by the same
//! resolver for the same platform and interpreter.

use super::write_atomic;
use crate::error::UvImageResult;
use crate::fingerprint::Fingerprint;
use crate::resolver::LockedGraph;
use crate::spec::Platform;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Directory of `<fingerprint>.lock.toml` files
pub struct LockStore {
    dir: PathBuf,
}

impl LockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the lockfile for a fingerprint
    pub fn path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.lock.toml", fingerprint))
    }

    /// Load the stored lock for a fingerprint if it is still valid.
    ///
    /// Missing, unreadable and stale lockfiles all yield `None`; the caller
    /// resolves again and overwrites them.
    pub async fn load(
        &self,
        fingerprint: &Fingerprint,
        resolver_version: &str,
        platform: &Platform,
        python: &str,
    ) -> Option<LockedGraph> {
        let path = self.path(fingerprint);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Ignoring unreadable lockfile {}: {}", path.display(), e);
                return None;
            }
        };

        let graph = match LockedGraph::from_lockfile(&content) {
            Ok(graph) => graph,
            Err(e) => {
                warn!("Ignoring invalid lockfile {}: {}", path.display(), e);
                return None;
            }
        };

        if graph.resolver != resolver_version || graph.platform != *platform || graph.python != python
        {
            debug!(
                "Stale lockfile {} ({} for {}), resolving again",
                path.display(),
                graph.resolver,
                graph.platform
            );
            return None;
        }

        debug!("Reusing lockfile {}", path.display());
        Some(graph)
    }

    /// Persist a resolved graph
    pub async fn save(&self, fingerprint: &Fingerprint, graph: &LockedGraph) -> UvImageResult<()> {
        let path = self.path(fingerprint);
        write_atomic(&path, graph.to_lockfile()?.as_bytes()).await?;
        debug!("Wrote lockfile {}", path.display());
        Ok(())
    }

    /// Raw lockfile text, if one is stored
    pub async fn read(&self, fingerprint: &Fingerprint) -> Option<String> {
        tokio::fs::read_to_string(self.path(fingerprint)).await.ok()
    }
}
