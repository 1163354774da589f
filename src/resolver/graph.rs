//! Pinned dependency graph produced by a resolver

use crate::error::{UvImageError, UvImageResult};
use crate::spec::Platform;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current lockfile format version
pub const LOCKFILE_VERSION: u32 = 1;

const LOCKFILE_HEADER: &str = "# Generated by uvimage. Do not edit by hand.\n";

/// A single pinned package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    /// Where the package comes from (`registry+https://pypi.org/simple`, `git+...`)
    pub source: String,
    /// Artifact hashes (`sha256:...`), sorted
    #[serde(default)]
    pub hashes: Vec<String>,
    /// Platform tags of the published wheels, sorted. Empty when only an sdist exists.
    #[serde(default)]
    pub wheel_tags: Vec<String>,
    /// Whether a source distribution is available
    #[serde(default)]
    pub has_sdist: bool,
    /// Names of direct dependencies, sorted
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl LockedPackage {
    fn canonicalize(&mut self) {
        self.hashes.sort();
        self.hashes.dedup();
        self.wheel_tags.sort();
        self.wheel_tags.dedup();
        self.dependencies.sort();
        self.dependencies.dedup();
    }

    /// `name==version` pin
    pub fn pin(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}

/// Fully pinned, deterministically ordered resolution result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedGraph {
    pub version: u32,
    /// Resolver name and version that produced this graph
    pub resolver: String,
    pub platform: Platform,
    pub python: String,
    #[serde(default, rename = "package")]
    pub packages: Vec<LockedPackage>,
}

impl LockedGraph {
    /// Build a graph, putting packages and their fields in canonical order
    pub fn new(
        resolver: impl Into<String>,
        platform: Platform,
        python: impl Into<String>,
        mut packages: Vec<LockedPackage>,
    ) -> Self {
        for package in &mut packages {
            package.canonicalize();
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        Self {
            version: LOCKFILE_VERSION,
            resolver: resolver.into(),
            platform,
            python: python.into(),
            packages,
        }
    }

    /// Human-readable lockfile text with stable ordering
    pub fn to_lockfile(&self) -> UvImageResult<String> {
        let body = toml::to_string_pretty(self)?;
        Ok(format!("{}{}", LOCKFILE_HEADER, body))
    }

    /// Parse lockfile text written by [`LockedGraph::to_lockfile`]
    pub fn from_lockfile(content: &str) -> UvImageResult<Self> {
        let graph: Self = toml::from_str(content)?;
        if graph.version != LOCKFILE_VERSION {
            return Err(UvImageError::Internal(format!(
                "unsupported lockfile version {}",
                graph.version
            )));
        }
        Ok(graph)
    }

    /// Canonical bytes used for determinism checks
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Plain data without maps: serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Short SHA-256 of the canonical bytes, for log lines and error messages
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.canonical_bytes());
        hex::encode(&hash[..6])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, version: &str, deps: &[&str]) -> LockedPackage {
        LockedPackage {
            name: name.to_string(),
            version: version.to_string(),
            source: "registry+https://pypi.org/simple".to_string(),
            hashes: vec!["sha256:bb".to_string(), "sha256:aa".to_string()],
            wheel_tags: vec!["any".to_string()],
            has_sdist: true,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn new_sorts_packages_and_fields() {
        let graph = LockedGraph::new(
            "uv 0.5.0",
            Platform::default(),
            "3.12.0",
            vec![pkg("urllib3", "2.2.3", &[]), pkg("requests", "2.32.3", &["urllib3", "idna", "certifi"])],
        );
        assert_eq!(graph.packages[0].name, "requests");
        assert_eq!(graph.packages[0].dependencies, vec!["certifi", "idna", "urllib3"]);
        assert_eq!(graph.packages[0].hashes, vec!["sha256:aa", "sha256:bb"]);
    }

    #[test]
    fn input_order_does_not_change_bytes() {
        let a = LockedGraph::new(
            "uv",
            Platform::default(),
            "3.12.0",
            vec![pkg("a", "1", &["b"]), pkg("b", "2", &[])],
        );
        let b = LockedGraph::new(
            "uv",
            Platform::default(),
            "3.12.0",
            vec![pkg("b", "2", &[]), pkg("a", "1", &["b"])],
        );
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn lockfile_text_parses_back() {
        let graph = LockedGraph::new(
            "uv 0.5.0",
            Platform::default(),
            "3.12.0",
            vec![pkg("requests", "2.32.3", &["idna"]), pkg("idna", "3.10", &[])],
        );
        let text = graph.to_lockfile().unwrap();
        assert!(text.starts_with("# Generated by uvimage"));
        assert!(text.contains("[[package]]"));
        assert!(text.contains("platform = \"linux/amd64\""));
        let parsed = LockedGraph::from_lockfile(&text).unwrap();
        assert_eq!(parsed, graph);
    }

    #[test]
    fn rejects_unknown_lockfile_version() {
        let text = "version = 99\nresolver = \"uv\"\nplatform = \"linux/amd64\"\npython = \"3.12.0\"\n";
        assert!(LockedGraph::from_lockfile(text).is_err());
    }
}
