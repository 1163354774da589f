//! Materialize an environment spec into an image
//!
//! The pipeline wires the stages together for one request:
//!
//! ```text
//! EnvironmentSpec -> normalize -> fingerprint -> (cache hit?) -> resolve -> plan -> build
//! ```
//!
//! An image that is already cached costs one normalization, two tool
//! version queries (cached per process) and one store lookup. Every failure is
//! reported as a [`StageError`] naming the stage and the fingerprint.

use crate::builder::ImageBuilder;
use crate::cache::{CacheStore, ImageReference, LockStore};
use crate::error::{Stage, StageError, UvImageError, UvImageResult};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::orchestration::{Orchestrator, OrchestratorSettings};
use crate::plan::{generate, BuildPlan};
use crate::resolver::{LockResolver, LockedGraph, ResolverBackend, ResolverSettings};
use crate::spec::{normalize_with, EnvironmentSpec, NormalizedSpec, SpecDefaults};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback receiving builder output lines
pub type OutputSink = Arc<dyn Fn(String) + Send + Sync>;

/// Callback told when a request enters a stage
pub type StageHook = Arc<dyn Fn(Stage, Option<&Fingerprint>) + Send + Sync>;

/// Pipeline settings, usually derived from the config file
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub defaults: SpecDefaults,
    pub resolver: ResolverSettings,
    pub orchestrator: OrchestratorSettings,
    /// Resolver attempts when the resolver times out (at least 1)
    pub max_attempts: u32,
    /// Delay before the first retry; doubled per attempt
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            defaults: SpecDefaults::default(),
            resolver: ResolverSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// A normalized spec with its fingerprint and the tool versions behind it
#[derive(Debug, Clone)]
pub struct Prepared {
    pub spec: NormalizedSpec,
    pub fingerprint: Fingerprint,
    pub resolver_version: String,
    pub builder_version: String,
}

/// Stage and fingerprint of an in-flight request, for cancellation reports
#[derive(Default)]
struct Progress {
    current: Mutex<(Option<Stage>, Option<Fingerprint>)>,
}

impl Progress {
    fn enter(&self, stage: Stage, fingerprint: Option<&Fingerprint>) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current = (Some(stage), fingerprint.cloned());
    }

    fn snapshot(&self) -> (Stage, Option<Fingerprint>) {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        (current.0.unwrap_or(Stage::Normalize), current.1.clone())
    }
}

pub struct Pipeline {
    resolver: LockResolver,
    orchestrator: Orchestrator,
    lock_store: Option<LockStore>,
    settings: PipelineSettings,
    output: OutputSink,
    stage_hook: Option<StageHook>,
}

impl Pipeline {
    pub fn new(
        resolver: Arc<dyn ResolverBackend>,
        builder: Arc<dyn ImageBuilder>,
        store: Arc<dyn CacheStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            resolver: LockResolver::new(resolver, settings.resolver.clone()),
            orchestrator: Orchestrator::new(store, builder, settings.orchestrator.clone()),
            lock_store: None,
            settings,
            output: Arc::new(|line| debug!("build: {}", line)),
            stage_hook: None,
        }
    }

    /// Persist resolved graphs and reuse them for the same fingerprint
    pub fn with_lock_store(mut self, store: LockStore) -> Self {
        self.lock_store = Some(store);
        self
    }

    /// Send builder output somewhere other than the debug log
    pub fn with_build_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn with_stage_hook(mut self, hook: StageHook) -> Self {
        self.stage_hook = Some(hook);
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn lock_store(&self) -> Option<&LockStore> {
        self.lock_store.as_ref()
    }

    /// Materialize a spec, returning the tagged image
    pub async fn materialize(&self, spec: &EnvironmentSpec) -> Result<ImageReference, StageError> {
        self.run(spec, &Progress::default()).await
    }

    /// Materialize a spec unless `cancel` completes first.
    ///
    /// Cancelling drops the in-flight stage: resolver and builder processes
    /// are killed and locks released. The error names the stage that was
    /// interrupted.
    pub async fn materialize_until<F>(
        &self,
        spec: &EnvironmentSpec,
        cancel: F,
    ) -> Result<ImageReference, StageError>
    where
        F: Future<Output = ()>,
    {
        let progress = Progress::default();
        tokio::select! {
            result = self.run(spec, &progress) => result,
            _ = cancel => {
                let (stage, fingerprint) = progress.snapshot();
                warn!("Cancelled during {} stage", stage);
                Err(StageError::new(stage, fingerprint.as_ref(), UvImageError::Cancelled))
            }
        }
    }

    async fn run(
        &self,
        spec: &EnvironmentSpec,
        progress: &Progress,
    ) -> Result<ImageReference, StageError> {
        self.enter(progress, Stage::Normalize, None);
        let prepared = self.prepare(spec).await?;
        let fp = &prepared.fingerprint;

        self.enter(progress, Stage::Build, Some(fp));
        let cached = self
            .orchestrator
            .lookup(fp)
            .await
            .map_err(|e| StageError::new(Stage::Build, Some(fp), e))?;
        if let Some(image) = cached {
            info!("Using cached image {}", image);
            return Ok(image);
        }

        self.enter(progress, Stage::Resolve, Some(fp));
        let locked = self.lock(&prepared).await?;

        self.enter(progress, Stage::Plan, Some(fp));
        let plan = self.plan(&prepared, &locked)?;

        self.enter(progress, Stage::Build, Some(fp));
        self.build(&prepared, &plan).await
    }

    fn enter(&self, progress: &Progress, stage: Stage, fingerprint: Option<&Fingerprint>) {
        progress.enter(stage, fingerprint);
        if let Some(hook) = &self.stage_hook {
            hook(stage, fingerprint);
        }
    }

    /// Normalize a spec and compute its fingerprint
    pub async fn prepare(&self, spec: &EnvironmentSpec) -> Result<Prepared, StageError> {
        let normalized = self
            .normalize(spec)
            .await
            .map_err(|e| StageError::new(Stage::Normalize, None, e))?;

        // The fingerprint depends on the tool versions, so a failed version query has none
        let versions = async {
            let resolver = self.resolver.version().await?;
            let builder = self.orchestrator.builder_version().await?;
            UvImageResult::Ok((resolver, builder))
        };
        let (resolver_version, builder_version) = versions
            .await
            .map_err(|e| StageError::new(Stage::Fingerprint, None, e))?;

        let fp = fingerprint(
            &normalized,
            &resolver_version,
            &builder_version,
            &normalized.platform,
        );
        debug!(
            "Fingerprint {} ({}, {}, {})",
            fp.short(),
            resolver_version,
            builder_version,
            normalized.platform
        );

        Ok(Prepared {
            spec: normalized,
            fingerprint: fp,
            resolver_version,
            builder_version,
        })
    }

    /// Normalize off the async workers when a source tree has to be read
    async fn normalize(&self, spec: &EnvironmentSpec) -> UvImageResult<NormalizedSpec> {
        if spec.source_root.is_none() {
            return normalize_with(spec, &self.settings.defaults);
        }
        let spec = spec.clone();
        let defaults = self.settings.defaults.clone();
        tokio::task::spawn_blocking(move || normalize_with(&spec, &defaults))
            .await
            .map_err(|e| UvImageError::Internal(format!("source snapshot task failed: {}", e)))?
    }

    /// Resolve the locked graph, reusing a stored lockfile when it is current
    pub async fn lock(&self, prepared: &Prepared) -> Result<LockedGraph, StageError> {
        let fp = &prepared.fingerprint;

        if let Some(store) = &self.lock_store {
            let stored = store
                .load(
                    fp,
                    &prepared.resolver_version,
                    &prepared.spec.platform,
                    &prepared.spec.python,
                )
                .await;
            if let Some(graph) = stored {
                info!("Reusing lockfile for {}", fp.short());
                return Ok(graph);
            }
        }

        let graph = self
            .resolve_with_retry(&prepared.spec)
            .await
            .map_err(|e| StageError::new(Stage::Resolve, Some(fp), e))?;

        if let Some(store) = &self.lock_store {
            if let Err(e) = store.save(fp, &graph).await {
                warn!("Could not persist lockfile for {}: {}", fp.short(), e);
            }
        }
        Ok(graph)
    }

    /// Resolve, retrying timeouts with capped exponential backoff
    async fn resolve_with_retry(&self, spec: &NormalizedSpec) -> UvImageResult<LockedGraph> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut delay = self.settings.backoff;
        let mut attempt = 1;

        loop {
            match self.resolver.resolve(spec).await {
                Err(e @ UvImageError::ResolverTimeout { .. }) if attempt < max_attempts => {
                    warn!(
                        "{} (attempt {}/{}), retrying in {:?}",
                        e, attempt, max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_backoff(delay, self.settings.max_backoff);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Generate the build plan for a prepared spec and its lock
    pub fn plan(&self, prepared: &Prepared, locked: &LockedGraph) -> Result<BuildPlan, StageError> {
        generate(&prepared.spec, locked)
            .map_err(|e| StageError::new(Stage::Plan, Some(&prepared.fingerprint), e))
    }

    /// Build (or find) the image for a plan
    pub async fn build(
        &self,
        prepared: &Prepared,
        plan: &BuildPlan,
    ) -> Result<ImageReference, StageError> {
        self.orchestrator
            .ensure_image(
                &prepared.fingerprint,
                plan,
                &prepared.resolver_version,
                &*self.output,
            )
            .await
            .map_err(|e| StageError::new(Stage::Build, Some(&prepared.fingerprint), e))
    }
}

/// Double a retry delay without overflowing, capped at `max`
fn next_backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}
