//! uv resolver backend
//!
//! Resolution runs `uv lock` against a throwaway virtual project. The
//! project pins `requires-python` to the target interpreter series and
//! limits `tool.uv.environments` to the target platform, so the lock holds
//! exactly the packages the image needs.

use super::{LockedPackage, ResolveRequest, ResolverBackend, ResolverOutcome};
use crate::error::{UvImageError, UvImageResult};
use crate::process::{describe_status, output_tail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Oldest uv release with the `lock` options used here
pub const MIN_UV_VERSION: &str = "0.4.0";

/// Resolver backend that shells out to `uv`
pub struct UvBackend {
    binary: String,
}

impl UvBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run_lock(
        &self,
        project: &Path,
        request: &ResolveRequest,
    ) -> UvImageResult<std::process::Output> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("lock")
            .arg("--project")
            .arg(project)
            .args(["--no-config", "--no-progress", "--color", "never"]);
        if let Some(ref url) = request.index_url {
            cmd.args(["--index-url", url]);
        }
        for url in &request.extra_index_urls {
            cmd.args(["--extra-index-url", url]);
        }

        debug!("Executing: {} lock --project {}", self.binary, project.display());
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| UvImageError::command_failed(format!("{} lock", self.binary), e))
    }
}

impl Default for UvBackend {
    fn default() -> Self {
        Self::new("uv")
    }
}

#[async_trait]
impl ResolverBackend for UvBackend {
    async fn version(&self) -> UvImageResult<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| UvImageError::command_failed(format!("{} --version", self.binary), e))?;

        if !output.status.success() {
            return Err(UvImageError::ResolverCrash {
                status: describe_status(&output.status),
                diagnostics: output_tail(
                    &String::from_utf8_lossy(&output.stdout),
                    &String::from_utf8_lossy(&output.stderr),
                ),
            });
        }

        let version = parse_version_output(&String::from_utf8_lossy(&output.stdout))?;
        Ok(format!("uv {}", version))
    }

    async fn invoke(&self, request: &ResolveRequest) -> UvImageResult<ResolverOutcome> {
        let scratch = ScratchDir::create().await?;
        let pyproject = render_pyproject(request)?;
        let pyproject_path = scratch.path().join("pyproject.toml");
        tokio::fs::write(&pyproject_path, pyproject)
            .await
            .map_err(|e| UvImageError::io(format!("writing {}", pyproject_path.display()), e))?;

        let output = self.run_lock(scratch.path(), request).await?;
        if !output.status.success() {
            return Ok(ResolverOutcome::Failed {
                status: describe_status(&output.status),
                diagnostics: output_tail(
                    &String::from_utf8_lossy(&output.stdout),
                    &String::from_utf8_lossy(&output.stderr),
                ),
            });
        }

        let lock_path = scratch.path().join("uv.lock");
        let content = tokio::fs::read_to_string(&lock_path)
            .await
            .map_err(|e| UvImageError::io(format!("reading {}", lock_path.display()), e))?;
        Ok(ResolverOutcome::Locked(parse_uv_lock(&content)?))
    }

    fn backend_name(&self) -> &'static str {
        "uv"
    }
}

/// Extract and check the version from `uv --version` output (`uv 0.5.11 (c4d0caaee 2024-12-19)`)
fn parse_version_output(stdout: &str) -> UvImageResult<semver::Version> {
    let raw = stdout.split_whitespace().nth(1).unwrap_or_default();
    let version = semver::Version::parse(raw).map_err(|e| UvImageError::ResolverCrash {
        status: "unrecognized version".to_string(),
        diagnostics: format!("could not parse uv version from '{}': {}", stdout.trim(), e),
    })?;

    let minimum = semver::Version::parse(MIN_UV_VERSION)
        .map_err(|e| UvImageError::Internal(format!("bad minimum uv version: {}", e)))?;
    if version < minimum {
        return Err(UvImageError::ResolverCrash {
            status: "unsupported version".to_string(),
            diagnostics: format!(
                "uv {} is older than the minimum supported version {}",
                version, MIN_UV_VERSION
            ),
        });
    }
    Ok(version)
}

#[derive(Serialize)]
struct Pyproject<'a> {
    project: Project<'a>,
    tool: Tool,
}

#[derive(Serialize)]
struct Project<'a> {
    name: &'static str,
    version: &'static str,
    #[serde(rename = "requires-python")]
    requires_python: String,
    dependencies: &'a [String],
}

#[derive(Serialize)]
struct Tool {
    uv: UvTool,
}

#[derive(Serialize)]
struct UvTool {
    package: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    environments: Vec<String>,
}

/// Render the scratch project definition for a request
fn render_pyproject(request: &ResolveRequest) -> UvImageResult<String> {
    let series: Vec<&str> = request.python.split('.').take(2).collect();
    let environments = match request.platform.environment_marker() {
        Some(marker) => vec![marker],
        None => {
            warn!(
                "No environment marker for {}; resolving for all platforms",
                request.platform
            );
            Vec::new()
        }
    };

    let doc = Pyproject {
        project: Project {
            name: "uvimage-env",
            version: "0.0.0",
            requires_python: format!("=={}.*", series.join(".")),
            dependencies: &request.requirements,
        },
        tool: Tool {
            uv: UvTool {
                package: false,
                environments,
            },
        },
    };
    Ok(toml::to_string(&doc)?)
}

#[derive(Deserialize)]
struct UvLock {
    #[serde(default)]
    package: Vec<UvLockPackage>,
}

#[derive(Deserialize)]
struct UvLockPackage {
    name: String,
    version: Option<String>,
    #[serde(default)]
    source: BTreeMap<String, toml::Value>,
    #[serde(default)]
    dependencies: Vec<UvLockDependency>,
    sdist: Option<UvLockArtifact>,
    #[serde(default)]
    wheels: Vec<UvLockArtifact>,
}

#[derive(Deserialize)]
struct UvLockDependency {
    name: String,
}

#[derive(Deserialize)]
struct UvLockArtifact {
    url: Option<String>,
    path: Option<String>,
    filename: Option<String>,
    hash: Option<String>,
}

impl UvLockArtifact {
    fn filename(&self) -> Option<&str> {
        if let Some(ref name) = self.filename {
            return Some(name);
        }
        let location = self.url.as_deref().or(self.path.as_deref())?;
        location.rsplit('/').next()
    }
}

/// Source kinds in the order they are reported
const SOURCE_KINDS: [&str; 5] = ["registry", "git", "url", "path", "directory"];

/// Parse the packages out of a `uv.lock` file, skipping project entries
pub(crate) fn parse_uv_lock(content: &str) -> UvImageResult<Vec<LockedPackage>> {
    let lock: UvLock = toml::from_str(content)?;
    let mut packages = Vec::new();

    for entry in lock.package {
        if entry.source.contains_key("virtual") || entry.source.contains_key("editable") {
            debug!("Skipping project entry {}", entry.name);
            continue;
        }

        let version = entry.version.ok_or_else(|| {
            UvImageError::Internal(format!("uv.lock entry '{}' has no version", entry.name))
        })?;
        let source = SOURCE_KINDS
            .iter()
            .find_map(|kind| {
                entry
                    .source
                    .get(*kind)
                    .and_then(toml::Value::as_str)
                    .map(|loc| format!("{}+{}", kind, loc))
            })
            .unwrap_or_else(|| "unknown".to_string());

        let mut hashes: Vec<String> = entry
            .sdist
            .iter()
            .chain(entry.wheels.iter())
            .filter_map(|a| a.hash.clone())
            .collect();
        hashes.sort();

        let wheel_tags = entry
            .wheels
            .iter()
            .filter_map(UvLockArtifact::filename)
            .flat_map(wheel_platform_tags)
            .collect();

        packages.push(LockedPackage {
            name: entry.name,
            version,
            source,
            hashes,
            wheel_tags,
            has_sdist: entry.sdist.is_some(),
            dependencies: entry.dependencies.into_iter().map(|d| d.name).collect(),
        });
    }

    Ok(packages)
}

/// Platform tags of a wheel filename (`numpy-2.1.0-cp312-cp312-manylinux_2_17_x86_64.manylinux2014_x86_64.whl`)
pub(crate) fn wheel_platform_tags(filename: &str) -> Vec<String> {
    let stem = filename.strip_suffix(".whl").unwrap_or(filename);
    match stem.rsplit('-').next() {
        Some(tags) if stem.contains('-') => tags.split('.').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Temporary project directory, removed on drop
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    async fn create() -> UvImageResult<Self> {
        let path = std::env::temp_dir().join(format!("uvimage-resolve-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| UvImageError::io(format!("creating {}", path.display()), e))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            debug!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UV_LOCK: &str = r#"
version = 1
requires-python = "==3.12.*"

[[package]]
name = "certifi"
version = "2024.8.30"
source = { registry = "https://pypi.org/simple" }
sdist = { url = "https://files.pythonhosted.org/certifi-2024.8.30.tar.gz", hash = "sha256:bec9", size = 168507 }
wheels = [
    { url = "https://files.pythonhosted.org/certifi-2024.8.30-py3-none-any.whl", hash = "sha256:922", size = 167321 },
]

[[package]]
name = "requests"
version = "2.32.3"
source = { registry = "https://pypi.org/simple" }
dependencies = [
    { name = "urllib3" },
    { name = "certifi" },
]
wheels = [
    { url = "https://files.pythonhosted.org/requests-2.32.3-py3-none-any.whl", hash = "sha256:70761", size = 64928 },
]

[[package]]
name = "uvimage-env"
version = "0.0.0"
source = { virtual = "." }
dependencies = [
    { name = "requests" },
]
"#;

    fn request(platform: &str) -> ResolveRequest {
        ResolveRequest {
            requirements: vec!["requests>=2.0".to_string()],
            python: "3.12.0".to_string(),
            platform: platform.parse().unwrap(),
            index_url: None,
            extra_index_urls: Vec::new(),
        }
    }

    #[test]
    fn parses_lock_and_skips_project() {
        let packages = parse_uv_lock(UV_LOCK).unwrap();
        assert_eq!(packages.len(), 2);

        let certifi = &packages[0];
        assert_eq!(certifi.version, "2024.8.30");
        assert_eq!(certifi.source, "registry+https://pypi.org/simple");
        assert_eq!(certifi.hashes, vec!["sha256:922", "sha256:bec9"]);
        assert_eq!(certifi.wheel_tags, vec!["any"]);
        assert!(certifi.has_sdist);

        let requests = &packages[1];
        assert_eq!(requests.dependencies, vec!["urllib3", "certifi"]);
        assert!(!requests.has_sdist);
    }

    #[test]
    fn rejects_entry_without_version() {
        let lock = "version = 1\n[[package]]\nname = \"x\"\nsource = { git = \"https://example.com/x\" }\n";
        assert!(parse_uv_lock(lock).is_err());
    }

    #[test]
    fn wheel_tags_from_filenames() {
        assert_eq!(
            wheel_platform_tags(
                "numpy-2.1.0-cp312-cp312-manylinux_2_17_x86_64.manylinux2014_x86_64.whl"
            ),
            vec!["manylinux_2_17_x86_64", "manylinux2014_x86_64"]
        );
        assert_eq!(wheel_platform_tags("six-1.16.0-py2.py3-none-any.whl"), vec!["any"]);
        assert!(wheel_platform_tags("garbage").is_empty());
    }

    #[test]
    fn pyproject_targets_interpreter_and_platform() {
        let text = render_pyproject(&request("linux/arm64")).unwrap();
        assert!(text.contains("requires-python = \"==3.12.*\""));
        assert!(text.contains("\"requests>=2.0\""));
        assert!(text.contains("package = false"));
        assert!(text.contains("platform_machine == 'aarch64'"));
    }

    #[test]
    fn pyproject_without_marker_is_universal() {
        let text = render_pyproject(&request("plan9/amd64")).unwrap();
        assert!(!text.contains("environments"));
    }

    #[test]
    fn version_output_parsing() {
        let v = parse_version_output("uv 0.5.11 (c4d0caaee 2024-12-19)\n").unwrap();
        assert_eq!(v, semver::Version::new(0, 5, 11));
        assert!(matches!(
            parse_version_output("uv 0.3.5"),
            Err(UvImageError::ResolverCrash { .. })
        ));
        assert!(parse_version_output("something else").is_err());
    }

    #[tokio::test]
    async fn scratch_dir_removed_on_drop() {
        let scratch = ScratchDir::create().await.unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.is_dir());
        drop(scratch);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_binary_is_command_failure() {
        let backend = UvBackend::new("/nonexistent/uv-binary");
        let err = backend.version().await.unwrap_err();
        assert!(matches!(err, UvImageError::CommandFailed { .. }));
    }
}
