//! Configuration schema for uvimage
//!
//! Configuration is stored at `~/.config/uvimage/config.toml`

use crate::spec::{
    EnvironmentSpec, SpecDefaults, DEFAULT_IMAGE_NAME, DEFAULT_PLATFORM, DEFAULT_PYTHON_VERSION, DEFAULT_UV_IMAGE,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Defaults filled into specs
    pub defaults: DefaultsConfig,

    /// Dependency resolver settings
    pub resolver: ResolverConfig,

    /// Image builder settings
    pub builder: BuilderConfig,

    /// Image cache settings
    pub cache: CacheConfig,
}

impl Config {
    /// Apply config-level packages and index URLs to a submitted spec
    pub fn augment_spec(&self, spec: &EnvironmentSpec) -> EnvironmentSpec {
        let mut spec = spec.clone();
        spec.packages.extend(self.defaults.extra_packages.iter().cloned());
        if spec.pip_index.is_none() {
            spec.pip_index = self.resolver.index_url.clone();
        }
        spec.pip_extra_index_urls.extend(self.resolver.extra_index_urls.iter().cloned());
        spec
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Values used for spec fields left unset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Interpreter version
    pub python: String,

    /// Base image
    pub base_image: String,

    /// Target platform
    pub platform: String,

    /// Image repository name
    pub repository: String,

    /// Registry prefix joined to the repository (`ghcr.io/acme`)
    pub registry: Option<String>,

    /// Packages appended to every spec (e.g. a framework runtime)
    pub extra_packages: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            python: DEFAULT_PYTHON_VERSION.to_string(),
            base_image: DEFAULT_UV_IMAGE.to_string(),
            platform: DEFAULT_PLATFORM.to_string(),
            repository: DEFAULT_IMAGE_NAME.to_string(),
            registry: None,
            extra_packages: vec![],
        }
    }
}

impl DefaultsConfig {
    /// Spec defaults with the registry prefix applied to the repository name
    pub fn spec_defaults(&self) -> SpecDefaults {
        let name = match self.registry {
            Some(ref registry) => format!("{}/{}", registry.trim_end_matches('/'), self.repository),
            None => self.repository.clone(),
        };
        SpecDefaults {
            python: self.python.clone(),
            base_image: self.base_image.clone(),
            platform: self.platform.clone(),
            name,
        }
    }
}

/// Dependency resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Backend name (registered in the backend registry)
    pub backend: String,

    /// Resolver executable
    pub binary: String,

    /// Per-invocation timeout in seconds
    pub timeout_secs: u64,

    /// Attempts for timed out resolutions (1 = no retry)
    pub max_attempts: u32,

    /// Initial backoff between attempts in milliseconds
    pub backoff_ms: u64,

    /// Upper bound on the backoff in milliseconds
    pub max_backoff_ms: u64,

    /// Resolve twice and compare results before building
    pub verify_determinism: bool,

    /// Index URL used when a spec does not set one
    pub index_url: Option<String>,

    /// Extra index URLs appended to every spec
    pub extra_index_urls: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            backend: "uv".to_string(),
            binary: "uv".to_string(),
            timeout_secs: 300,
            max_attempts: 3,
            backoff_ms: 500,
            max_backoff_ms: 10_000,
            verify_determinism: false,
            index_url: None,
            extra_index_urls: vec![],
        }
    }
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Image builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Backend name: "docker" or "podman"
    pub backend: String,

    /// Builder executable; defaults to the backend name
    pub binary: Option<String>,

    /// Push images after building
    pub push: bool,

    /// Extra arguments passed to the build command
    pub extra_args: Vec<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            backend: "docker".to_string(),
            binary: None,
            push: false,
            extra_args: vec![],
        }
    }
}

/// Image cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Store backend: "local" or "memory"
    pub backend: String,

    /// Cache directory (default: state dir)
    pub dir: Option<PathBuf>,

    /// Seconds to wait for a build lock before giving up
    pub lock_timeout_secs: u64,

    /// Seconds a store lease stays valid without release
    pub lease_ttl_secs: u64,

    /// Keep resolved lockfiles for reuse
    pub persist_lockfiles: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            dir: None,
            lock_timeout_secs: 600,
            lease_ttl_secs: 3600,
            persist_lockfiles: true,
        }
    }
}

impl CacheConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[resolver]"));
        assert!(toml.contains("[cache]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.resolver.backend, "uv");
        assert_eq!(config.builder.backend, "docker");
        assert_eq!(config.defaults.python, "3.12");
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [resolver]
            timeout_secs = 30
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.resolver.timeout(), Duration::from_secs(30));
        assert_eq!(config.resolver.max_attempts, 3); // default preserved
        assert_eq!(config.cache.backend, "local");
    }

    #[test]
    fn augment_spec_adds_config_entries() {
        let mut config = Config::default();
        config.defaults.extra_packages = vec!["flytekit>=1.10".to_string()];
        config.resolver.index_url = Some("https://mirror.example/simple".to_string());

        let spec = EnvironmentSpec {
            packages: vec!["requests".to_string()],
            ..Default::default()
        };
        let augmented = config.augment_spec(&spec);
        assert_eq!(augmented.packages, vec!["requests", "flytekit>=1.10"]);
        assert_eq!(
            augmented.pip_index.as_deref(),
            Some("https://mirror.example/simple")
        );

        let explicit = EnvironmentSpec {
            pip_index: Some("https://own.example/simple".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.augment_spec(&explicit).pip_index.as_deref(),
            Some("https://own.example/simple")
        );
    }

    #[test]
    fn registry_prefixes_repository() {
        let defaults = DefaultsConfig {
            registry: Some("ghcr.io/acme/".to_string()),
            ..Default::default()
        };
        assert_eq!(defaults.spec_defaults().name, "ghcr.io/acme/uvimage");
        assert_eq!(DefaultsConfig::default().spec_defaults().name, "uvimage");
    }
}
