//! Build cache orchestration
//!
//! The [`Orchestrator`] is the only writer of the cache store. For a
//! fingerprint it either returns the cached image or builds it exactly once:
//!
//! 1. Cache lookup (no locks on the hit path)
//! 2. In-process per-fingerprint lock
//! 3. Cache re-check
//! 4. Store lease, polled (other processes)
//! 5. Build context, builder invocation, durable cache write
//!
//! Steps 2 and 4 share one `lock_timeout` deadline. The lease is renewed
//! while the builder runs, so a long build is never mistaken for a crashed
//! one. Locks, leases and the build directory are guards, so dropping the
//! future at any await point releases them.

mod locks;

use crate::builder::{BuildRequest, ImageBuilder};
use crate::cache::{CacheStore, ImageCacheEntry, ImageReference, Lease};
use crate::error::{UvImageError, UvImageResult};
use crate::fingerprint::Fingerprint;
use crate::plan::{BuildContext, BuildPlan};
use chrono::Utc;
use locks::BuildLocks;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Orchestrator timing and placement settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// How long a request waits for a concurrent build of the same fingerprint
    pub lock_timeout: Duration,
    /// Lease lifetime; a lease not renewed for this long is presumed abandoned
    pub lease_ttl: Duration,
    /// Interval between lease attempts
    pub lease_poll: Duration,
    /// Parent directory of build contexts
    pub builds_dir: PathBuf,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(600),
            lease_ttl: Duration::from_secs(3600),
            lease_poll: Duration::from_millis(250),
            builds_dir: std::env::temp_dir().join("uvimage-builds"),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn CacheStore>,
    builder: Arc<dyn ImageBuilder>,
    settings: OrchestratorSettings,
    locks: BuildLocks,
    builder_version: OnceCell<String>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CacheStore>,
        builder: Arc<dyn ImageBuilder>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            builder,
            settings,
            locks: BuildLocks::default(),
            builder_version: OnceCell::new(),
        }
    }

    /// Builder version, queried once per process
    pub async fn builder_version(&self) -> UvImageResult<String> {
        self.builder_version
            .get_or_try_init(|| self.builder.version())
            .await
            .cloned()
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Cached image for a fingerprint, if any
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> UvImageResult<Option<ImageReference>> {
        Ok(self.store.get(fingerprint).await?.map(|entry| entry.image))
    }

    /// Return the image for `fingerprint`, building it from `plan` on a miss
    pub async fn ensure_image(
        &self,
        fingerprint: &Fingerprint,
        plan: &BuildPlan,
        resolver_version: &str,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> UvImageResult<ImageReference> {
        if let Some(image) = self.lookup(fingerprint).await? {
            debug!("Cache hit for {}: {}", fingerprint.short(), image);
            return Ok(image);
        }

        let deadline = Instant::now() + self.settings.lock_timeout;
        let _lock = self
            .locks
            .acquire(fingerprint, deadline)
            .await
            .ok_or_else(|| in_progress(fingerprint))?;

        // A concurrent request may have finished while we waited
        if let Some(image) = self.lookup(fingerprint).await? {
            debug!("Built concurrently for {}: {}", fingerprint.short(), image);
            return Ok(image);
        }

        let lease = match self.wait_for_lease(fingerprint, deadline).await? {
            LeaseWait::Acquired(lease) => lease,
            LeaseWait::BuiltElsewhere(image) => return Ok(image),
        };

        let image = ImageReference::for_fingerprint(&plan.repository, fingerprint);
        let builder_version = self.builder_version().await?;
        let context =
            BuildContext::prepare(plan, &self.settings.builds_dir, fingerprint.short()).await?;

        info!(
            "Building {} with {} ({} step(s))",
            image,
            builder_version,
            plan.steps.len()
        );
        let request = BuildRequest {
            context_dir: context.dir().to_path_buf(),
            dockerfile: context.dockerfile(),
            image: image.to_string(),
            platform: plan.platform.clone(),
            secrets: plan.secret_mounts.clone(),
        };
        self.build_holding(&lease, &request, on_output).await?;

        let entry = ImageCacheEntry {
            fingerprint: fingerprint.clone(),
            image: image.clone(),
            built_at: Utc::now(),
            resolver_version: resolver_version.to_string(),
            builder_version,
            platform: plan.platform.clone(),
        };
        self.store.put(&entry).await?;
        info!("Cached {}", image);

        Ok(image)
    }

    /// Run the builder, renewing `lease` every third of its TTL until it finishes
    async fn build_holding(
        &self,
        lease: &Lease,
        request: &BuildRequest,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> UvImageResult<()> {
        let ttl = self.settings.lease_ttl;
        let period = (ttl / 3).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        let build = self.builder.build(request, on_output);
        tokio::pin!(build);
        loop {
            tokio::select! {
                result = &mut build => return result,
                _ = heartbeat.tick() => {
                    if !lease.renew(ttl) {
                        warn!("Build lease for {} was lost during the build", request.image);
                    }
                }
            }
        }
    }

    /// Poll the store lease until it is ours, another process finishes the
    /// build, or `deadline` passes
    async fn wait_for_lease(
        &self,
        fingerprint: &Fingerprint,
        deadline: Instant,
    ) -> UvImageResult<LeaseWait> {
        loop {
            let lease = self
                .store
                .acquire_lease(fingerprint, self.settings.lease_ttl)
                .await?;
            // The previous holder writes the entry before releasing the lease
            if let Some(image) = self.lookup(fingerprint).await? {
                debug!("Built by another process: {}", image);
                return Ok(LeaseWait::BuiltElsewhere(image));
            }
            if let Some(lease) = lease {
                return Ok(LeaseWait::Acquired(lease));
            }
            if Instant::now() >= deadline {
                return Err(in_progress(fingerprint));
            }
            debug!(
                "Build lease for {} is held elsewhere, waiting",
                fingerprint.short()
            );
            tokio::time::sleep(self.settings.lease_poll).await;
        }
    }
}

enum LeaseWait {
    Acquired(Lease),
    BuiltElsewhere(ImageReference),
}

fn in_progress(fingerprint: &Fingerprint) -> UvImageError {
    UvImageError::BuildInProgress {
        fingerprint: fingerprint.to_string(),
    }
}
