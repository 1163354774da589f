//! Lock resolution
//!
//! The [`LockResolver`] turns a normalized spec into a [`LockedGraph`] by
//! driving an external resolver through the [`ResolverBackend`] trait. It
//! owns everything around the external call: a conflict pre-check, the
//! timeout, failure classification and the optional determinism check.

mod graph;
pub mod uv;

pub use graph::{LockedGraph, LockedPackage, LOCKFILE_VERSION};
pub use uv::UvBackend;

use crate::error::{UvImageError, UvImageResult};
use crate::spec::{NormalizedSpec, Platform, Requirement, VersionRange};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Structured input handed to a resolver backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    /// Canonical requirement strings, sorted
    pub requirements: Vec<String>,
    /// Interpreter version (`3.12.0`)
    pub python: String,
    pub platform: Platform,
    pub index_url: Option<String>,
    pub extra_index_urls: Vec<String>,
}

impl ResolveRequest {
    pub fn from_spec(spec: &NormalizedSpec) -> Self {
        Self {
            requirements: spec.requirements.iter().map(Requirement::to_string).collect(),
            python: spec.python.clone(),
            platform: spec.platform.clone(),
            index_url: spec.index.url.clone(),
            extra_index_urls: spec.index.extra_urls.clone(),
        }
    }
}

/// What a backend reports back for one invocation
#[derive(Debug, Clone)]
pub enum ResolverOutcome {
    /// Resolution succeeded; packages in any order
    Locked(Vec<LockedPackage>),
    /// The process ended unsuccessfully
    Failed {
        /// `exit code N` or `terminated by signal`
        status: String,
        /// Captured stdout+stderr tail
        diagnostics: String,
    },
}

/// Abstract external dependency resolver
#[async_trait]
pub trait ResolverBackend: Send + Sync {
    /// Resolver name and version (`uv 0.5.11`); part of the fingerprint
    async fn version(&self) -> UvImageResult<String>;

    /// Run one resolution
    async fn invoke(&self, request: &ResolveRequest) -> UvImageResult<ResolverOutcome>;

    /// Human-readable backend name
    fn backend_name(&self) -> &'static str;
}

/// Resolver settings taken from configuration
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub timeout: Duration,
    /// Resolve twice and compare before accepting a graph
    pub verify_determinism: bool,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            verify_determinism: false,
        }
    }
}

/// Drives a [`ResolverBackend`] and classifies its failures
pub struct LockResolver {
    backend: Arc<dyn ResolverBackend>,
    settings: ResolverSettings,
    version: OnceCell<String>,
}

impl LockResolver {
    pub fn new(backend: Arc<dyn ResolverBackend>, settings: ResolverSettings) -> Self {
        Self {
            backend,
            settings,
            version: OnceCell::new(),
        }
    }

    /// Resolver version, queried once per process
    pub async fn version(&self) -> UvImageResult<String> {
        self.version
            .get_or_try_init(|| self.backend.version())
            .await
            .cloned()
    }

    /// Resolve a normalized spec to a pinned graph
    pub async fn resolve(&self, spec: &NormalizedSpec) -> UvImageResult<LockedGraph> {
        check_satisfiable(&spec.requirements)?;

        let version = self.version().await?;
        let request = ResolveRequest::from_spec(spec);
        debug!(
            "Resolving {} requirement(s) with {} for {}",
            request.requirements.len(),
            version,
            request.platform
        );

        let graph = self.resolve_once(&request, &version).await?;

        if self.settings.verify_determinism {
            let second = self.resolve_once(&request, &version).await?;
            if second.canonical_bytes() != graph.canonical_bytes() {
                error!(
                    "Resolver {} is non-deterministic: {} != {}; cached images for this spec cannot be trusted",
                    version,
                    graph.digest(),
                    second.digest()
                );
                return Err(UvImageError::NonDeterministicResolution {
                    first: graph.digest(),
                    second: second.digest(),
                });
            }
            debug!("Determinism check passed ({})", graph.digest());
        }

        info!(
            "Resolved {} package(s) for {} ({})",
            graph.packages.len(),
            request.platform,
            graph.digest()
        );
        Ok(graph)
    }

    async fn resolve_once(
        &self,
        request: &ResolveRequest,
        version: &str,
    ) -> UvImageResult<LockedGraph> {
        // Dropping the invocation on timeout kills the child (kill_on_drop)
        let outcome = tokio::time::timeout(self.settings.timeout, self.backend.invoke(request))
            .await
            .map_err(|_| UvImageError::ResolverTimeout {
                timeout_secs: self.settings.timeout.as_secs(),
            })??;

        match outcome {
            ResolverOutcome::Locked(packages) => Ok(LockedGraph::new(
                version,
                request.platform.clone(),
                request.python.clone(),
                packages,
            )),
            ResolverOutcome::Failed {
                status,
                diagnostics,
            } => Err(classify_failure(&request.requirements, status, diagnostics)),
        }
    }
}

/// Reject requirement sets where some package has no admissible version.
///
/// Reports every requirement on each conflicting package.
pub fn check_satisfiable(requirements: &[Requirement]) -> UvImageResult<()> {
    let mut by_name: BTreeMap<&str, Vec<&Requirement>> = BTreeMap::new();
    for req in requirements {
        by_name.entry(req.name.as_str()).or_default().push(req);
    }

    let mut conflicts = Vec::new();
    for reqs in by_name.values() {
        let mut range = VersionRange::default();
        for req in reqs {
            for clause in req.constraint.clauses() {
                range.restrict(clause);
            }
        }
        if range.is_empty() {
            conflicts.extend(reqs.iter().map(|r| r.to_string()));
        }
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(UvImageError::Unsatisfiable { conflicts })
    }
}

/// Markers the resolver prints when no solution exists
const UNSATISFIABLE_MARKERS: [&str; 3] = [
    "no solution found",
    "requirements are unsatisfiable",
    "resolutionimpossible",
];

/// Classify a failed resolver run as unsatisfiable or as a crash
fn classify_failure(requirements: &[String], status: String, diagnostics: String) -> UvImageError {
    let lowered = diagnostics.to_lowercase();
    if UNSATISFIABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        let mentioned: Vec<String> = requirements
            .iter()
            .filter(|req| {
                let name = requirement_name(req);
                mentions_word(&lowered, name)
            })
            .cloned()
            .collect();
        let conflicts = if mentioned.is_empty() {
            requirements.to_vec()
        } else {
            mentioned
        };
        return UvImageError::Unsatisfiable { conflicts };
    }

    UvImageError::ResolverCrash {
        status,
        diagnostics,
    }
}

/// Name part of a canonical requirement string
fn requirement_name(req: &str) -> &str {
    let end = req
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .unwrap_or(req.len());
    &req[..end]
}

/// Whether `word` appears in `text` delimited by non-name characters
fn mentions_word(text: &str, word: &str) -> bool {
    let is_name_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    text.match_indices(word).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + word.len()..].chars().next();
        !before.is_some_and(is_name_char) && !after.is_some_and(is_name_char)
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted resolver backend shared by pipeline tests

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Backend that pins every requirement to `1.0.0` unless told otherwise
    pub struct FakeResolver {
        pub calls: AtomicUsize,
        pub delay: Duration,
        /// Outcomes returned in order before falling back to pinning
        pub scripted: Mutex<Vec<ResolverOutcome>>,
        pub version: String,
    }

    impl FakeResolver {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                scripted: Mutex::new(Vec::new()),
                version: "uv 0.5.0".to_string(),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn with_script(self, outcomes: Vec<ResolverOutcome>) -> Self {
            *self.scripted.lock().unwrap() = outcomes;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub fn package(name: &str, version: &str) -> LockedPackage {
        LockedPackage {
            name: name.to_string(),
            version: version.to_string(),
            source: "registry+https://pypi.org/simple".to_string(),
            hashes: vec![format!("sha256:{:0>64}", name.len())],
            wheel_tags: vec!["any".to_string()],
            has_sdist: true,
            dependencies: Vec::new(),
        }
    }

    #[async_trait]
    impl ResolverBackend for FakeResolver {
        async fn version(&self) -> UvImageResult<String> {
            Ok(self.version.clone())
        }

        async fn invoke(&self, request: &ResolveRequest) -> UvImageResult<ResolverOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = {
                let mut script = self.scripted.lock().unwrap();
                if script.is_empty() {
                    None
                } else {
                    Some(script.remove(0))
                }
            };
            if let Some(outcome) = scripted {
                return Ok(outcome);
            }
            let packages = request
                .requirements
                .iter()
                .map(|r| package(requirement_name(r), "1.0.0"))
                .collect();
            Ok(ResolverOutcome::Locked(packages))
        }

        fn backend_name(&self) -> &'static str {
            "fake"
        }
    }
}
