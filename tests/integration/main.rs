//! Integration tests for uvimage

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn uvimage() -> Command {
        let mut cmd = cargo_bin_cmd!("uvimage");
        cmd.env_remove("UVIMAGE_CONFIG");
        cmd
    }

    /// Config file that keeps the cache inside `dir`
    fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
        let path = dir.join("config.toml");
        let cache = dir.join("cache");
        std::fs::write(
            &path,
            format!("[cache]\ndir = \"{}\"\n{}", cache.display(), extra),
        )
        .unwrap();
        path
    }

    #[test]
    fn help_displays() {
        uvimage()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("reproducible container images"));
    }

    #[test]
    fn version_displays() {
        uvimage()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("uvimage"));
    }

    #[test]
    fn build_requires_a_spec() {
        uvimage().arg("build").assert().failure();
    }

    #[test]
    fn config_path_follows_flag() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.toml");
        uvimage()
            .args(["--config", path.to_str().unwrap(), "config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_path_follows_env() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("from-env.toml");
        uvimage()
            .env("UVIMAGE_CONFIG", &path)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("from-env.toml"));
    }

    #[test]
    fn config_show_prints_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.toml");
        uvimage()
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[resolver]"))
            .stdout(predicate::str::contains("[cache]"));
    }

    #[test]
    fn config_init_writes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");
        uvimage()
            .args(["--plain", "--config", path.to_str().unwrap(), "config", "init"])
            .assert()
            .success();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[builder]"));
    }

    #[test]
    fn invalid_config_fails_with_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[resolver\nbackend = ").unwrap();
        uvimage()
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn completions_generate() {
        uvimage()
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("uvimage"));
    }

    #[test]
    fn cache_list_empty_as_json() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "");
        uvimage()
            .args(["--plain", "--config", config.to_str().unwrap()])
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::diff("[]\n"));
    }

    #[test]
    fn cache_show_rejects_short_prefix() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "");
        uvimage()
            .args(["--plain", "--config", config.to_str().unwrap()])
            .args(["cache", "show", "abc"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No cache entry"));
    }

    #[test]
    fn unknown_builder_backend_is_reported() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "[builder]\nbackend = \"kaniko\"\n");
        let spec = temp.path().join("env.toml");
        std::fs::write(&spec, "python = \"3.12\"\npackages = [\"requests\"]\n").unwrap();

        uvimage()
            .args(["--plain", "--config", config.to_str().unwrap()])
            .args(["fingerprint", spec.to_str().unwrap()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("kaniko"))
            .stderr(predicate::str::contains("docker, podman"));
    }

    #[test]
    fn invalid_spec_fails_before_tool_version_queries() {
        let temp = TempDir::new().unwrap();
        let config = write_config(
            temp.path(),
            "[resolver]\nbinary = \"/nonexistent/uv\"\n",
        );
        let spec = temp.path().join("env.toml");
        std::fs::write(&spec, "python = \"three\"\n").unwrap();

        uvimage()
            .args(["--plain", "--config", config.to_str().unwrap()])
            .args(["fingerprint", spec.to_str().unwrap()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid environment spec"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn missing_resolver_binary_is_reported() {
        let temp = TempDir::new().unwrap();
        let config = write_config(
            temp.path(),
            "[resolver]\nbinary = \"/nonexistent/uv\"\n",
        );
        let spec = temp.path().join("env.toml");
        std::fs::write(&spec, "python = \"3.12\"\npackages = [\"requests\"]\n").unwrap();

        uvimage()
            .args(["--plain", "--config", config.to_str().unwrap()])
            .args(["fingerprint", spec.to_str().unwrap()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Command failed"))
            .stderr(predicate::str::contains("/nonexistent/uv"));
    }

    #[test]
    fn missing_spec_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "");
        let spec = temp.path().join("absent.toml");

        uvimage()
            .args(["--plain", "--config", config.to_str().unwrap()])
            .args(["lock", spec.to_str().unwrap()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("absent.toml"));
    }
}
