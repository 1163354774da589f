//! CLI command implementations

pub mod build;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod lock;

pub use build::execute as build;
pub use cache::execute as cache;
pub use config::execute as config;
pub use fingerprint::execute as fingerprint;
pub use lock::{execute_lock as lock, execute_plan as plan};

use crate::cli::Cli;
use crate::config::Config;
use crate::error::UvImageResult;
use crate::spec::EnvironmentSpec;
use clap::CommandFactory;
use clap_complete::Shell;
use std::path::Path;
use tracing::debug;

/// Read a spec file and apply config-level additions and a platform override
pub(crate) async fn load_spec(
    path: &Path,
    platform: Option<&str>,
    config: &Config,
) -> UvImageResult<EnvironmentSpec> {
    let spec = EnvironmentSpec::from_file(path).await?;
    let mut spec = config.augment_spec(&spec);
    if let Some(platform) = platform {
        debug!("Platform override: {}", platform);
        spec.platform = Some(platform.to_string());
    }
    Ok(spec)
}

/// Resolves once Ctrl-C is pressed; never if the handler cannot be installed
pub(crate) async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Print completions for `shell` to stdout
pub fn completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_spec_applies_config_and_override() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("env.toml");
        std::fs::write(&path, "python = \"3.11\"\npackages = [\"requests>=2.0\"]\n").unwrap();

        let mut config = Config::default();
        config.defaults.extra_packages = vec!["uvicorn".to_string()];

        let spec = load_spec(&path, Some("linux/arm64"), &config).await.unwrap();
        assert_eq!(spec.python.as_deref(), Some("3.11"));
        assert_eq!(spec.packages, vec!["requests>=2.0", "uvicorn"]);
        assert_eq!(spec.platform.as_deref(), Some("linux/arm64"));
    }

    #[tokio::test]
    async fn load_spec_reports_missing_file() {
        let err = load_spec(Path::new("/nonexistent/env.toml"), None, &Config::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reading spec"));
    }
}
