//! Dockerfile and requirements rendering

use super::{BuildPlan, BuildStep};
use crate::error::{UvImageError, UvImageResult};
use crate::resolver::{LockedGraph, LockedPackage};

/// Directory the image's project and virtual environment live in
pub const APP_DIR: &str = "/app";

/// Name of the pinned requirements file inside the build context
pub const REQUIREMENTS_FILE: &str = "requirements.lock";

/// Build context directory holding the project source tree
pub const SOURCE_DIR: &str = "src";

const UV_CACHE_MOUNT: &str = "--mount=type=cache,target=/root/.cache/uv";

/// Render a plan as Dockerfile text
pub fn dockerfile(plan: &BuildPlan) -> String {
    let mut lines = vec!["# syntax=docker/dockerfile:1".to_string()];

    for step in &plan.steps {
        match step {
            BuildStep::Base { image } => {
                lines.push(format!("FROM {}", image));
                lines.push(format!("WORKDIR {}", APP_DIR));
            }
            BuildStep::SystemPackages { packages } => {
                lines.push(format!(
                    "RUN apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
                    packages.join(" ")
                ));
            }
            BuildStep::Environment { vars } => {
                for (key, value) in vars {
                    lines.push(format!("ENV {}={}", key, dockerfile_quote(value)));
                }
            }
            BuildStep::Interpreter { python } => {
                lines.push("ENV UV_COMPILE_BYTECODE=1".to_string());
                lines.push("ENV UV_LINK_MODE=copy".to_string());
                lines.push(format!(
                    "RUN {} uv venv --python {} {}/.venv",
                    UV_CACHE_MOUNT,
                    python_series(python),
                    APP_DIR
                ));
            }
            BuildStep::Dependencies {
                packages,
                require_hashes,
                index,
            } => {
                if !packages.is_empty() {
                    lines.push(format!(
                        "COPY {} {}/{}",
                        REQUIREMENTS_FILE, APP_DIR, REQUIREMENTS_FILE
                    ));
                    let mut run = format!("RUN {}", UV_CACHE_MOUNT);
                    for secret in &plan.secret_mounts {
                        run.push_str(&format!(
                            " --mount=type=secret,id={},env={}",
                            secret.id, secret.env
                        ));
                    }
                    run.push_str(&format!(" uv pip sync --python {}/.venv/bin/python", APP_DIR));
                    if *require_hashes {
                        run.push_str(" --require-hashes");
                    }
                    if let Some(ref url) = index.url {
                        run.push_str(&format!(" --index-url {}", shell_quote(url)));
                    }
                    for url in &index.extra_urls {
                        run.push_str(&format!(" --extra-index-url {}", shell_quote(url)));
                    }
                    run.push_str(&format!(" {}/{}", APP_DIR, REQUIREMENTS_FILE));
                    lines.push(run);
                }
                lines.push(format!("ENV VIRTUAL_ENV={}/.venv", APP_DIR));
                lines.push(format!(
                    "ENV PATH={}",
                    dockerfile_quote(&format!("{}/.venv/bin:$PATH", APP_DIR))
                ));
                lines.push("ENTRYPOINT []".to_string());
            }
            BuildStep::Source { .. } => {
                lines.push(format!("COPY {}/ {}/", SOURCE_DIR, APP_DIR));
            }
            BuildStep::Command { command } => {
                lines.push(format!("RUN {}", command));
            }
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Quote a value for Dockerfile ENV instruction.
/// Values containing $ (variable references) must be quoted properly.
/// Embedded double quotes and backslashes are escaped to prevent injection.
pub(crate) fn dockerfile_quote(value: &str) -> String {
    if value.is_empty()
        || value.contains('$')
        || value.contains(' ')
        || value.contains('"')
        || value.contains('\\')
    {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
    } else {
        value.to_string()
    }
}

/// `major.minor` of an interpreter version, matching the resolver's `requires-python`
fn python_series(python: &str) -> String {
    python.split('.').take(2).collect::<Vec<&str>>().join(".")
}

/// Single-quote a word for `/bin/sh`
fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Whether every locked package carries at least one hash
pub(crate) fn hashes_complete(locked: &LockedGraph) -> bool {
    !locked.packages.is_empty() && locked.packages.iter().all(|p| !p.hashes.is_empty())
}

/// Render the pinned requirements file installed into the image.
///
/// Hashes are emitted only when every package has one, since a partially
/// hashed file is rejected by hash-checking installers.
pub fn requirements_lock(locked: &LockedGraph) -> UvImageResult<String> {
    let with_hashes = hashes_complete(locked);
    let mut out = format!(
        "# Generated by uvimage from {} for {} (lock {})\n",
        locked.resolver,
        locked.platform,
        locked.digest()
    );

    for package in &locked.packages {
        let requirement = install_requirement(package)?;
        if with_hashes {
            out.push_str(&requirement);
            for hash in &package.hashes {
                out.push_str(&format!(" \\\n    --hash={}", hash));
            }
            out.push('\n');
        } else {
            out.push_str(&requirement);
            out.push('\n');
        }
    }
    Ok(out)
}

/// Requirement line for one locked package, by source kind
fn install_requirement(package: &LockedPackage) -> UvImageResult<String> {
    let (kind, location) = package
        .source
        .split_once('+')
        .unwrap_or((package.source.as_str(), ""));

    match kind {
        "registry" => Ok(package.pin()),
        "git" => {
            // uv records `https://host/repo?rev=main#<commit>`
            let (repo, commit) = location.split_once('#').unwrap_or((location, ""));
            let repo = repo.split('?').next().unwrap_or(repo);
            if commit.is_empty() {
                Ok(format!("{} @ git+{}", package.name, repo))
            } else {
                Ok(format!("{} @ git+{}@{}", package.name, repo, commit))
            }
        }
        "url" => Ok(format!("{} @ {}", package.name, location)),
        _ => Err(UvImageError::spec_invalid(
            "packages",
            format!(
                "{} resolved to a {} source, which cannot be installed into an image",
                package.pin(),
                kind
            ),
        )),
    }
}
