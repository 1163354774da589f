//! Docker and Podman CLI builders

use super::{BuildRequest, ImageBuilder};
use crate::error::{UvImageError, UvImageResult};
use crate::process::{output_tail, stream_child_output, tail_lines};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Supported build engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    Docker,
    Podman,
}

impl BuilderKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// Builder that shells out to `docker build` or `podman build`
pub struct CliBuilder {
    kind: BuilderKind,
    binary: String,
    push: bool,
    extra_args: Vec<String>,
}

impl CliBuilder {
    pub fn new(kind: BuilderKind) -> Self {
        Self {
            kind,
            binary: kind.name().to_string(),
            push: false,
            extra_args: Vec::new(),
        }
    }

    /// Use a specific executable instead of the engine name
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Push the image after a successful build
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Arguments for the build command
    fn build_args(&self, request: &BuildRequest) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--tag".to_string(),
            request.image.clone(),
            "--file".to_string(),
            request.dockerfile.display().to_string(),
            "--platform".to_string(),
            request.platform.to_string(),
        ];
        // Line-oriented output so build steps can be tracked
        if self.kind == BuilderKind::Docker {
            args.push("--progress=plain".to_string());
        }
        for secret in &request.secrets {
            args.push("--secret".to_string());
            args.push(format!("id={},env={}", secret.id, secret.env));
        }
        // Podman has no `build --push`; it pushes in a separate step
        if self.push && self.kind == BuilderKind::Docker {
            args.push("--push".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(request.context_dir.display().to_string());
        args
    }

    async fn push_image(&self, image: &str) -> UvImageResult<()> {
        info!("Pushing {}", image);
        let output = Command::new(&self.binary)
            .args(["push", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| UvImageError::command_failed(format!("{} push", self.binary), e))?;

        if !output.status.success() {
            return Err(UvImageError::BuildFailed {
                image: image.to_string(),
                log: output_tail(
                    &String::from_utf8_lossy(&output.stdout),
                    &String::from_utf8_lossy(&output.stderr),
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for CliBuilder {
    async fn version(&self) -> UvImageResult<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| UvImageError::command_failed(format!("{} --version", self.binary), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_engine_version(&stdout)
            .map(|v| format!("{} {}", self.kind.name(), v))
            .ok_or_else(|| {
                UvImageError::Internal(format!(
                    "could not determine {} version from '{}'",
                    self.kind.name(),
                    stdout.trim()
                ))
            })
    }

    async fn build(
        &self,
        request: &BuildRequest,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> UvImageResult<()> {
        let args = self.build_args(request);
        debug!("Executing: {} {:?}", self.binary, args);

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        if self.kind == BuilderKind::Docker {
            cmd.env("DOCKER_BUILDKIT", "1");
        }
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| UvImageError::command_failed(format!("{} build", self.binary), e))?;

        let all_output = stream_child_output(&mut child, on_output).await;

        let status = child
            .wait()
            .await
            .map_err(|e| UvImageError::command_failed(format!("{} build", self.binary), e))?;

        if !status.success() {
            return Err(UvImageError::BuildFailed {
                image: request.image.clone(),
                log: tail_lines(&all_output),
            });
        }

        if self.push && self.kind == BuilderKind::Podman {
            self.push_image(&request.image).await?;
        }

        info!("Built {}", request.image);
        Ok(())
    }

    fn builder_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// First version-looking token of `--version` output
/// (`Docker version 27.0.1, build 7fafd33`, `podman version 5.2.2`)
fn parse_engine_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|token| token.trim_end_matches(','))
        .find(|token| semver::Version::parse(token).is_ok())
        .map(str::to_string)
}
