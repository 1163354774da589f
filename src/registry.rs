//! Backend registry
//!
//! Maps the backend names used in `config.toml` to factory functions.
//! The registry is populated once at startup; nothing is discovered
//! implicitly, so an unknown name is a configuration error listing the
//! names that do exist.

use crate::builder::{BuilderKind, CliBuilder, ImageBuilder};
use crate::cache::{CacheStore, FsCacheStore, LockStore, MemoryCacheStore};
use crate::config::{Config, ConfigManager};
use crate::error::{UvImageError, UvImageResult};
use crate::orchestration::OrchestratorSettings;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::resolver::{ResolverBackend, ResolverSettings, UvBackend};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type ResolverFactory = fn(&Config) -> UvImageResult<Arc<dyn ResolverBackend>>;
pub type BuilderFactory = fn(&Config) -> UvImageResult<Arc<dyn ImageBuilder>>;
pub type StoreFactory = fn(&Config) -> UvImageResult<Arc<dyn CacheStore>>;

/// Name to factory mapping for every pluggable backend
#[derive(Default)]
pub struct BackendRegistry {
    resolvers: BTreeMap<&'static str, ResolverFactory>,
    builders: BTreeMap<&'static str, BuilderFactory>,
    stores: BTreeMap<&'static str, StoreFactory>,
}

impl BackendRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_resolver("uv", uv_resolver);
        registry.register_builder("docker", docker_builder);
        registry.register_builder("podman", podman_builder);
        registry.register_store("local", local_store);
        registry.register_store("memory", memory_store);
        registry
    }

    pub fn register_resolver(&mut self, name: &'static str, factory: ResolverFactory) {
        self.resolvers.insert(name, factory);
    }

    pub fn register_builder(&mut self, name: &'static str, factory: BuilderFactory) {
        self.builders.insert(name, factory);
    }

    pub fn register_store(&mut self, name: &'static str, factory: StoreFactory) {
        self.stores.insert(name, factory);
    }

    pub fn resolver_names(&self) -> Vec<&'static str> {
        self.resolvers.keys().copied().collect()
    }

    pub fn builder_names(&self) -> Vec<&'static str> {
        self.builders.keys().copied().collect()
    }

    pub fn store_names(&self) -> Vec<&'static str> {
        self.stores.keys().copied().collect()
    }

    /// Create the resolver backend named in the config
    pub fn resolver(&self, config: &Config) -> UvImageResult<Arc<dyn ResolverBackend>> {
        let factory = lookup(&self.resolvers, "resolver", &config.resolver.backend)?;
        factory(config)
    }

    /// Create the image builder named in the config
    pub fn builder(&self, config: &Config) -> UvImageResult<Arc<dyn ImageBuilder>> {
        let factory = lookup(&self.builders, "builder", &config.builder.backend)?;
        factory(config)
    }

    /// Create the cache store named in the config
    pub fn store(&self, config: &Config) -> UvImageResult<Arc<dyn CacheStore>> {
        let factory = lookup(&self.stores, "cache", &config.cache.backend)?;
        factory(config)
    }

    /// Assemble a pipeline from the configured backends
    pub fn pipeline(&self, config: &Config) -> UvImageResult<Pipeline> {
        let resolver = self.resolver(config)?;
        let builder = self.builder(config)?;
        let store = self.store(config)?;
        debug!(
            "Backends: resolver={} builder={} cache={}",
            resolver.backend_name(),
            builder.builder_name(),
            store.store_name()
        );

        let mut pipeline = Pipeline::new(resolver, builder, store, pipeline_settings(config));
        if config.cache.persist_lockfiles {
            let dir = ConfigManager::cache_dir(config).join("locks");
            pipeline = pipeline.with_lock_store(LockStore::new(dir));
        }
        Ok(pipeline)
    }
}

/// Pipeline settings derived from the config file
pub fn pipeline_settings(config: &Config) -> PipelineSettings {
    PipelineSettings {
        defaults: config.defaults.spec_defaults(),
        resolver: ResolverSettings {
            timeout: config.resolver.timeout(),
            verify_determinism: config.resolver.verify_determinism,
        },
        orchestrator: OrchestratorSettings {
            lock_timeout: config.cache.lock_timeout(),
            lease_ttl: config.cache.lease_ttl(),
            builds_dir: ConfigManager::builds_dir(),
            ..Default::default()
        },
        max_attempts: config.resolver.max_attempts,
        backoff: Duration::from_millis(config.resolver.backoff_ms),
        max_backoff: Duration::from_millis(config.resolver.max_backoff_ms),
    }
}

fn lookup<F: Copy>(
    factories: &BTreeMap<&'static str, F>,
    kind: &'static str,
    name: &str,
) -> UvImageResult<F> {
    factories
        .get(name)
        .copied()
        .ok_or_else(|| UvImageError::UnknownBackend {
            kind,
            name: name.to_string(),
            available: factories.keys().copied().collect::<Vec<_>>().join(", "),
        })
}

fn uv_resolver(config: &Config) -> UvImageResult<Arc<dyn ResolverBackend>> {
    Ok(Arc::new(UvBackend::new(config.resolver.binary.clone())))
}

fn cli_builder(kind: BuilderKind, config: &Config) -> Arc<dyn ImageBuilder> {
    let mut builder = CliBuilder::new(kind)
        .with_push(config.builder.push)
        .with_extra_args(config.builder.extra_args.clone());
    if let Some(binary) = &config.builder.binary {
        builder = builder.with_binary(binary.clone());
    }
    Arc::new(builder)
}

fn docker_builder(config: &Config) -> UvImageResult<Arc<dyn ImageBuilder>> {
    Ok(cli_builder(BuilderKind::Docker, config))
}

fn podman_builder(config: &Config) -> UvImageResult<Arc<dyn ImageBuilder>> {
    Ok(cli_builder(BuilderKind::Podman, config))
}

fn local_store(config: &Config) -> UvImageResult<Arc<dyn CacheStore>> {
    Ok(Arc::new(FsCacheStore::new(ConfigManager::cache_dir(config))))
}

fn memory_store(_config: &Config) -> UvImageResult<Arc<dyn CacheStore>> {
    Ok(Arc::new(MemoryCacheStore::new()))
}
