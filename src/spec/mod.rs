//! Environment specs and their normalization
//!
//! An [`EnvironmentSpec`] is what the user declares. [`normalize`] turns it
//! into a [`NormalizedSpec`]: requirements parsed and sorted, defaults made
//! explicit, formatting noise removed. Two specs that mean the same thing
//! normalize to byte-identical canonical JSON, which is what the
//! fingerprint hashes.

pub mod platform;
pub mod requirement;
pub mod source;
pub mod version;

pub use platform::{Platform, DEFAULT_PLATFORM};
pub use requirement::Requirement;
pub use source::{SourceFile, SourceTree};
pub use version::{Constraint, Version, VersionRange};

use crate::error::{UvImageError, UvImageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Interpreter version used when the spec does not pin one
pub const DEFAULT_PYTHON_VERSION: &str = "3.12";

/// Base image used when the spec does not override it
pub const DEFAULT_UV_IMAGE: &str = "ghcr.io/astral-sh/uv:python3.12-bookworm-slim";

/// Image repository name used when the spec does not name one
pub const DEFAULT_IMAGE_NAME: &str = "uvimage";

/// A build secret exposed to dependency install steps
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretMount {
    /// Secret id known to the builder (`--secret id=...`)
    pub id: String,
    /// Environment variable the secret is exposed as
    pub env: String,
}

/// User-declared environment, as submitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentSpec {
    /// Image repository name
    pub name: Option<String>,

    /// Interpreter version (`3.12`, `3.11.9`)
    pub python: Option<String>,

    /// Package requirements (`requests>=2.0`)
    pub packages: Vec<String>,

    /// System packages installed with apt
    pub apt_packages: Vec<String>,

    /// Extra shell commands run last, in order
    pub commands: Vec<String>,

    /// Base image override
    pub base_image: Option<String>,

    /// Environment variables baked into the image
    pub env: BTreeMap<String, String>,

    /// Primary package index URL
    pub pip_index: Option<String>,

    /// Additional package index URLs, in priority order
    pub pip_extra_index_urls: Vec<String>,

    /// Secrets available to install steps
    pub pip_secret_mounts: Vec<SecretMount>,

    /// Target platform (`linux/amd64`)
    pub platform: Option<String>,

    /// Project directory copied into the image
    pub source_root: Option<PathBuf>,
}

impl EnvironmentSpec {
    /// Load a spec from a `.toml` or `.json` file
    pub async fn from_file(path: &Path) -> UvImageResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| UvImageError::io(format!("reading spec {}", path.display()), e))?;

        let mut spec: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content).map_err(|e| {
                UvImageError::spec_invalid(path.display().to_string(), e.to_string())
            })?,
        };

        // A relative source root is relative to the spec file
        if let (Some(root), Some(dir)) = (spec.source_root.as_mut(), path.parent()) {
            if root.is_relative() {
                *root = dir.join(&*root);
            }
        }
        Ok(spec)
    }
}

/// Defaults filled into unset spec fields
#[derive(Debug, Clone)]
pub struct SpecDefaults {
    pub python: String,
    pub base_image: String,
    pub platform: String,
    pub name: String,
}

impl Default for SpecDefaults {
    fn default() -> Self {
        Self {
            python: DEFAULT_PYTHON_VERSION.to_string(),
            base_image: DEFAULT_UV_IMAGE.to_string(),
            platform: DEFAULT_PLATFORM.to_string(),
            name: DEFAULT_IMAGE_NAME.to_string(),
        }
    }
}

/// Package index configuration after normalization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub url: Option<String>,
    pub extra_urls: Vec<String>,
}

/// Canonical form of an [`EnvironmentSpec`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedSpec {
    pub name: String,
    pub python: String,
    pub platform: Platform,
    pub base_image: String,
    pub requirements: Vec<Requirement>,
    pub apt_packages: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub commands: Vec<String>,
    pub index: IndexConfig,
    pub secret_mounts: Vec<SecretMount>,
    /// Absent from the canonical form when unset, keeping older fingerprints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceTree>,
}

impl NormalizedSpec {
    /// Canonical byte serialization (compact JSON, fixed field order)
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Only strings, maps with string keys and vectors: serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

impl From<NormalizedSpec> for EnvironmentSpec {
    fn from(spec: NormalizedSpec) -> Self {
        Self {
            name: Some(spec.name),
            python: Some(spec.python),
            packages: spec.requirements.iter().map(Requirement::to_string).collect(),
            apt_packages: spec.apt_packages,
            commands: spec.commands,
            base_image: Some(spec.base_image),
            env: spec.env,
            pip_index: spec.index.url,
            pip_extra_index_urls: spec.index.extra_urls,
            pip_secret_mounts: spec.secret_mounts,
            platform: Some(spec.platform.to_string()),
            source_root: spec.source.map(|tree| tree.root),
        }
    }
}

/// Normalize with the built-in defaults
pub fn normalize(spec: &EnvironmentSpec) -> UvImageResult<NormalizedSpec> {
    normalize_with(spec, &SpecDefaults::default())
}

/// Normalize, filling unset fields from `defaults`
pub fn normalize_with(
    spec: &EnvironmentSpec,
    defaults: &SpecDefaults,
) -> UvImageResult<NormalizedSpec> {
    let name = normalize_image_name(spec.name.as_deref().unwrap_or(&defaults.name))?;
    let python = normalize_python(spec.python.as_deref().unwrap_or(&defaults.python))?;

    let platform_text = spec.platform.as_deref().unwrap_or(&defaults.platform);
    let platform: Platform = platform_text
        .parse()
        .map_err(|e| UvImageError::spec_invalid("platform", e))?;

    let base_image = spec
        .base_image
        .as_deref()
        .unwrap_or(&defaults.base_image)
        .trim()
        .to_string();
    if base_image.is_empty() || base_image.contains(char::is_whitespace) {
        return Err(UvImageError::spec_invalid(
            "base_image",
            format!("invalid image reference '{}'", base_image),
        ));
    }

    let mut requirements = Vec::with_capacity(spec.packages.len());
    for (i, raw) in spec.packages.iter().enumerate() {
        let req: Requirement = raw
            .parse()
            .map_err(|e| UvImageError::spec_invalid(format!("packages[{}]", i), e))?;
        requirements.push(req);
    }
    requirements.sort_by_key(Requirement::sort_key);
    requirements.dedup();

    let mut apt_packages = Vec::with_capacity(spec.apt_packages.len());
    for (i, raw) in spec.apt_packages.iter().enumerate() {
        let pkg = raw.trim();
        let valid = !pkg.is_empty()
            && pkg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-' | ':' | '=' | '~'));
        if !valid {
            return Err(UvImageError::spec_invalid(
                format!("apt_packages[{}]", i),
                format!("invalid system package '{}'", pkg),
            ));
        }
        apt_packages.push(pkg.to_string());
    }
    apt_packages.sort();
    apt_packages.dedup();

    let mut env = BTreeMap::new();
    for (key, value) in &spec.env {
        let key = key.trim();
        let valid = key
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid || value.contains('\n') {
            return Err(UvImageError::spec_invalid(
                format!("env.{}", key),
                "keys must be identifiers and values single-line",
            ));
        }
        if env.insert(key.to_string(), value.clone()).is_some() {
            return Err(UvImageError::spec_invalid(
                format!("env.{}", key),
                "key repeats once surrounding whitespace is removed",
            ));
        }
    }

    let mut commands = Vec::with_capacity(spec.commands.len());
    for (i, raw) in spec.commands.iter().enumerate() {
        let cmd = raw.trim();
        if cmd.is_empty() || cmd.contains('\n') {
            return Err(UvImageError::spec_invalid(
                format!("commands[{}]", i),
                "commands must be non-empty single lines",
            ));
        }
        commands.push(cmd.to_string());
    }

    let url = spec
        .pip_index
        .as_deref()
        .map(|u| normalize_index_url("pip_index", u))
        .transpose()?;
    let mut extra_urls: Vec<String> = Vec::with_capacity(spec.pip_extra_index_urls.len());
    for (i, raw) in spec.pip_extra_index_urls.iter().enumerate() {
        let u = normalize_index_url(&format!("pip_extra_index_urls[{}]", i), raw)?;
        // Priority order matters; only drop repeats
        if !extra_urls.contains(&u) {
            extra_urls.push(u);
        }
    }

    let mut secret_mounts = Vec::with_capacity(spec.pip_secret_mounts.len());
    for (i, mount) in spec.pip_secret_mounts.iter().enumerate() {
        let id = mount.id.trim();
        let env = mount.env.trim();
        let ok = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        };
        if !ok(id) || !ok(env) {
            return Err(UvImageError::spec_invalid(
                format!("pip_secret_mounts[{}]", i),
                "secret id and env must be non-empty identifiers",
            ));
        }
        secret_mounts.push(SecretMount {
            id: id.to_string(),
            env: env.to_string(),
        });
    }
    secret_mounts.sort();
    secret_mounts.dedup();

    let source = spec
        .source_root
        .as_deref()
        .map(SourceTree::scan)
        .transpose()?;

    Ok(NormalizedSpec {
        name,
        python,
        platform,
        base_image,
        requirements,
        apt_packages,
        env,
        commands,
        index: IndexConfig { url, extra_urls },
        secret_mounts,
        source,
    })
}

/// Pad an interpreter version to `major.minor.patch`
fn normalize_python(raw: &str) -> UvImageResult<String> {
    let trimmed = raw.trim();
    let parts: Vec<&str> = trimmed.split('.').collect();
    let valid = (1..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !valid {
        return Err(UvImageError::spec_invalid(
            "python",
            format!("expected a version like 3.12 or 3.12.4, got '{}'", trimmed),
        ));
    }

    let mut numbers: Vec<u64> = Vec::with_capacity(3);
    for part in parts {
        let n = part
            .parse()
            .map_err(|_| UvImageError::spec_invalid("python", format!("'{}' out of range", part)))?;
        numbers.push(n);
    }
    numbers.resize(3, 0);
    Ok(format!("{}.{}.{}", numbers[0], numbers[1], numbers[2]))
}

fn normalize_image_name(raw: &str) -> UvImageResult<String> {
    let name = raw.trim().to_ascii_lowercase();
    let valid = !name.is_empty()
        && !name.starts_with(['/', ':', '.', '-'])
        && !name.ends_with(['/', ':', '.', '-'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':'));
    if !valid {
        return Err(UvImageError::spec_invalid(
            "name",
            format!("invalid image repository '{}'", raw.trim()),
        ));
    }
    // The fingerprint is the tag; a ':' is only allowed in a registry host port
    let last_component = name.rsplit('/').next().unwrap_or(name.as_str());
    if last_component.contains(':') {
        return Err(UvImageError::spec_invalid(
            "name",
            format!("'{}' must not carry a tag", raw.trim()),
        ));
    }
    Ok(name)
}

fn normalize_index_url(field: &str, raw: &str) -> UvImageResult<String> {
    let url = raw.trim().trim_end_matches('/').to_string();
    let scheme_ok = ["https://", "http://", "file://"]
        .iter()
        .any(|s| url.starts_with(s));
    if !scheme_ok || url.contains(char::is_whitespace) {
        return Err(UvImageError::spec_invalid(
            field,
            format!("invalid index URL '{}'", raw.trim()),
        ));
    }
    Ok(url)
}
