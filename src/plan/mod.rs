//! Build plan generation
//!
//! Turns a normalized spec and its locked graph into an ordered list of
//! build steps. The plan is pure data; rendering it into a Dockerfile and a
//! build directory lives in [`render`] and [`context`].

pub mod context;
pub mod render;

pub use context::BuildContext;

use crate::error::{UvImageError, UvImageResult};
use crate::resolver::{LockedGraph, LockedPackage};
use crate::spec::{IndexConfig, NormalizedSpec, Platform, SecretMount, SourceTree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One step of an image build, in execution order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildStep {
    /// Start from a base image
    Base { image: String },
    /// Install system packages with apt
    SystemPackages { packages: Vec<String> },
    /// Bake environment variables into the image
    Environment { vars: BTreeMap<String, String> },
    /// Create the virtual environment for an interpreter version
    Interpreter { python: String },
    /// Install the pinned dependency set
    Dependencies {
        packages: Vec<String>,
        require_hashes: bool,
        index: IndexConfig,
    },
    /// Copy the project source tree into the app directory
    Source { files: usize },
    /// User command, run as a shell `RUN`
    Command { command: String },
}

/// Ordered, fully pinned description of an image build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Image repository; the tag is the fingerprint
    pub repository: String,
    pub platform: Platform,
    pub steps: Vec<BuildStep>,
    pub secret_mounts: Vec<SecretMount>,
    /// Pinned requirements file installed by the dependency step
    pub requirements_lock: String,
    /// Files the build context carries for the source step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceTree>,
}

impl BuildPlan {
    /// Dockerfile text for this plan
    pub fn dockerfile(&self) -> String {
        render::dockerfile(self)
    }
}

/// Generate the build plan for a spec and its lock
pub fn generate(spec: &NormalizedSpec, locked: &LockedGraph) -> UvImageResult<BuildPlan> {
    if locked.platform != spec.platform {
        return Err(UvImageError::PlatformMismatch {
            lock_platform: locked.platform.to_string(),
            target: spec.platform.to_string(),
            reason: "lock was resolved for a different platform".to_string(),
        });
    }
    for package in &locked.packages {
        check_installable(package, &spec.platform)?;
    }

    let mut steps = vec![BuildStep::Base {
        image: spec.base_image.clone(),
    }];
    if !spec.apt_packages.is_empty() {
        steps.push(BuildStep::SystemPackages {
            packages: spec.apt_packages.clone(),
        });
    }
    if !spec.env.is_empty() {
        steps.push(BuildStep::Environment {
            vars: spec.env.clone(),
        });
    }
    steps.push(BuildStep::Interpreter {
        python: spec.python.clone(),
    });
    steps.push(BuildStep::Dependencies {
        packages: locked.packages.iter().map(LockedPackage::pin).collect(),
        require_hashes: render::hashes_complete(locked),
        index: spec.index.clone(),
    });
    if let Some(ref source) = spec.source {
        steps.push(BuildStep::Source {
            files: source.files.len(),
        });
    }
    for command in &spec.commands {
        steps.push(BuildStep::Command {
            command: command.clone(),
        });
    }

    Ok(BuildPlan {
        repository: spec.name.clone(),
        platform: spec.platform.clone(),
        steps,
        secret_mounts: spec.secret_mounts.clone(),
        requirements_lock: render::requirements_lock(locked)?,
        source: spec.source.clone(),
    })
}

/// Reject wheel-only packages without a wheel for the target
fn check_installable(package: &LockedPackage, platform: &Platform) -> UvImageResult<()> {
    if package.has_sdist || package.wheel_tags.is_empty() {
        return Ok(());
    }
    if package
        .wheel_tags
        .iter()
        .any(|tag| wheel_tag_compatible(tag, platform))
    {
        return Ok(());
    }
    Err(UvImageError::PlatformMismatch {
        lock_platform: package.wheel_tags.join(", "),
        target: platform.to_string(),
        reason: format!("{} has no wheel for the target platform", package.pin()),
    })
}

/// Whether a wheel platform tag can be installed on `platform`
pub fn wheel_tag_compatible(tag: &str, platform: &Platform) -> bool {
    if tag == "any" {
        return true;
    }
    let arch_matches = platform
        .wheel_arch_aliases()
        .iter()
        .any(|arch| tag.ends_with(arch));

    match platform.os() {
        "linux" => {
            ["manylinux", "musllinux", "linux"]
                .iter()
                .any(|prefix| tag.starts_with(prefix))
                && arch_matches
        }
        "darwin" => tag.starts_with("macosx") && (arch_matches || tag.ends_with("universal2")),
        "windows" => tag.starts_with("win") && arch_matches,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{normalize, EnvironmentSpec};

    fn spec(platform: &str) -> NormalizedSpec {
        normalize(&EnvironmentSpec {
            python: Some("3.11".to_string()),
            packages: vec!["numpy".to_string()],
            apt_packages: vec!["git".to_string()],
            commands: vec!["echo done".to_string()],
            env: [("MODE".to_string(), "prod".to_string())].into_iter().collect(),
            platform: Some(platform.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn numpy(tags: &[&str], has_sdist: bool) -> LockedPackage {
        LockedPackage {
            name: "numpy".to_string(),
            version: "2.1.0".to_string(),
            source: "registry+https://pypi.org/simple".to_string(),
            hashes: vec!["sha256:abc".to_string()],
            wheel_tags: tags.iter().map(|t| t.to_string()).collect(),
            has_sdist,
            dependencies: vec![],
        }
    }

    fn graph(platform: &str, packages: Vec<LockedPackage>) -> LockedGraph {
        LockedGraph::new("uv 0.5.0", platform.parse().unwrap(), "3.11.0", packages)
    }

    #[test]
    fn steps_follow_fixed_order() {
        let plan = generate(
            &spec("linux/amd64"),
            &graph("linux/amd64", vec![numpy(&["manylinux_2_17_x86_64"], false)]),
        )
        .unwrap();

        let kinds: Vec<&str> = plan
            .steps
            .iter()
            .map(|s| match s {
                BuildStep::Base { .. } => "base",
                BuildStep::SystemPackages { .. } => "apt",
                BuildStep::Environment { .. } => "env",
                BuildStep::Interpreter { .. } => "python",
                BuildStep::Dependencies { .. } => "deps",
                BuildStep::Source { .. } => "src",
                BuildStep::Command { .. } => "cmd",
            })
            .collect();
        assert_eq!(kinds, vec!["base", "apt", "env", "python", "deps", "cmd"]);
        assert_eq!(plan.repository, "uvimage");
        assert_eq!(
            plan.steps[0],
            BuildStep::Base {
                image: crate::spec::DEFAULT_UV_IMAGE.to_string()
            }
        );
    }

    #[test]
    fn generation_is_deterministic() {
        let s = spec("linux/amd64");
        let g = graph("linux/amd64", vec![numpy(&["any"], true)]);
        assert_eq!(generate(&s, &g).unwrap(), generate(&s, &g).unwrap());
    }

    #[test]
    fn lock_for_other_platform_is_rejected() {
        let err = generate(&spec("linux/amd64"), &graph("linux/arm64", vec![])).unwrap_err();
        assert!(matches!(err, UvImageError::PlatformMismatch { .. }));
    }

    #[test]
    fn wheel_only_package_needs_compatible_wheel() {
        let err = generate(
            &spec("linux/arm64"),
            &graph("linux/arm64", vec![numpy(&["manylinux_2_17_x86_64"], false)]),
        )
        .unwrap_err();
        match err {
            UvImageError::PlatformMismatch { reason, .. } => {
                assert!(reason.contains("numpy==2.1.0"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn source_step_sits_between_dependencies_and_commands() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("app.py"), "print('hi')").unwrap();
        let s = normalize(&EnvironmentSpec {
            commands: vec!["python -m compileall /app".to_string()],
            source_root: Some(temp.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        let g = LockedGraph::new("uv 0.5.0", s.platform.clone(), "3.12.0", vec![]);

        let plan = generate(&s, &g).unwrap();
        let tail = &plan.steps[plan.steps.len() - 3..];
        assert!(matches!(tail[0], BuildStep::Dependencies { .. }));
        assert_eq!(tail[1], BuildStep::Source { files: 1 });
        assert!(matches!(tail[2], BuildStep::Command { .. }));
        assert_eq!(plan.source, s.source);
    }

    #[test]
    fn sdist_makes_package_installable() {
        let plan = generate(
            &spec("linux/arm64"),
            &graph("linux/arm64", vec![numpy(&["manylinux_2_17_x86_64"], true)]),
        );
        assert!(plan.is_ok());
    }

    #[test]
    fn wheel_tag_matching() {
        let linux_amd: Platform = "linux/amd64".parse().unwrap();
        let linux_arm: Platform = "linux/arm64".parse().unwrap();
        let mac_arm: Platform = "darwin/arm64".parse().unwrap();
        let win: Platform = "windows/amd64".parse().unwrap();

        assert!(wheel_tag_compatible("any", &linux_arm));
        assert!(wheel_tag_compatible("manylinux2014_x86_64", &linux_amd));
        assert!(wheel_tag_compatible("musllinux_1_1_aarch64", &linux_arm));
        assert!(!wheel_tag_compatible("manylinux2014_x86_64", &linux_arm));
        assert!(!wheel_tag_compatible("macosx_11_0_arm64", &linux_arm));
        assert!(wheel_tag_compatible("macosx_11_0_arm64", &mac_arm));
        assert!(wheel_tag_compatible("macosx_10_9_universal2", &mac_arm));
        assert!(wheel_tag_compatible("win_amd64", &win));
        assert!(!wheel_tag_compatible("win32", &win));
    }
}
