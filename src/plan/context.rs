//! Build context directories
//!
//! A build context holds the rendered Dockerfile, the requirements file and,
//! when the plan carries one, the project source tree under `src/`.
//! Contexts live under the state dir's `builds/` and are removed when
//! dropped, including when a build is cancelled.

use super::render::{REQUIREMENTS_FILE, SOURCE_DIR};
use super::BuildPlan;
use crate::error::{UvImageError, UvImageResult};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prepared build directory, removed (best-effort) on drop
#[derive(Debug)]
pub struct BuildContext {
    dir: PathBuf,
}

impl BuildContext {
    /// Write the plan's files into a fresh directory under `builds_dir`
    pub async fn prepare(
        plan: &BuildPlan,
        builds_dir: &Path,
        label: &str,
    ) -> UvImageResult<Self> {
        let dir = builds_dir.join(format!("{}-{}", label, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            UvImageError::io(format!("creating build directory {}", dir.display()), e)
        })?;
        let context = Self { dir };

        tokio::fs::write(context.dockerfile(), plan.dockerfile())
            .await
            .map_err(|e| UvImageError::io("writing Dockerfile", e))?;
        tokio::fs::write(context.dir.join(REQUIREMENTS_FILE), &plan.requirements_lock)
            .await
            .map_err(|e| UvImageError::io(format!("writing {}", REQUIREMENTS_FILE), e))?;
        if let Some(ref source) = plan.source {
            source.copy_to(&context.dir.join(SOURCE_DIR)).await?;
        }

        debug!("Prepared build context {}", context.dir.display());
        Ok(context)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dockerfile(&self) -> PathBuf {
        self.dir.join("Dockerfile")
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        // Clean up build directory (best-effort)
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::generate;
    use crate::resolver::LockedGraph;
    use crate::spec::{normalize, EnvironmentSpec};
    use tempfile::TempDir;

    #[tokio::test]
    async fn prepare_writes_files_and_drop_cleans_up() {
        let temp = TempDir::new().unwrap();
        let spec = normalize(&EnvironmentSpec::default()).unwrap();
        let locked = LockedGraph::new("uv 0.5.0", spec.platform.clone(), "3.12.0", vec![]);
        let plan = generate(&spec, &locked).unwrap();

        let context = BuildContext::prepare(&plan, temp.path(), "abc123").await.unwrap();
        let dir = context.dir().to_path_buf();
        assert!(dir.file_name().unwrap().to_str().unwrap().starts_with("abc123-"));

        let dockerfile = tokio::fs::read_to_string(context.dockerfile()).await.unwrap();
        assert_eq!(dockerfile, plan.dockerfile());
        assert!(dir.join("requirements.lock").exists());

        assert!(!dir.join("src").exists());

        drop(context);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn prepare_copies_source_tree() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("project");
        std::fs::create_dir_all(project.join("pkg")).unwrap();
        std::fs::write(project.join("pkg/mod.py"), "X = 1").unwrap();
        std::fs::write(project.join("pyproject.toml"), "[project]").unwrap();

        let spec = normalize(&EnvironmentSpec {
            source_root: Some(project),
            ..Default::default()
        })
        .unwrap();
        let locked = LockedGraph::new("uv 0.5.0", spec.platform.clone(), "3.12.0", vec![]);
        let plan = generate(&spec, &locked).unwrap();

        let builds = temp.path().join("builds");
        let context = BuildContext::prepare(&plan, &builds, "src").await.unwrap();
        let copied = context.dir().join("src");
        assert_eq!(std::fs::read_to_string(copied.join("pkg/mod.py")).unwrap(), "X = 1");
        assert!(!copied.join("pyproject.toml").exists());
    }
}
