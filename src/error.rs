//! Error types for uvimage
//!
//! All modules use `UvImageResult<T>` as their return type. The pipeline
//! wraps failures in [`StageError`] so every error names the stage it came
//! from and the fingerprint of the request.

use crate::fingerprint::Fingerprint;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for uvimage operations
pub type UvImageResult<T> = Result<T, UvImageError>;

/// All errors that can occur in uvimage
#[derive(Error, Debug)]
pub enum UvImageError {
    // User input errors
    #[error("Invalid environment spec: {field}: {reason}")]
    SpecInvalid { field: String, reason: String },

    #[error("No version set satisfies the requirements: {}", .conflicts.join(", "))]
    Unsatisfiable { conflicts: Vec<String> },

    #[error("Lock {lock_platform} does not match target platform {target}: {reason}")]
    PlatformMismatch {
        lock_platform: String,
        target: String,
        reason: String,
    },

    // Resolver errors
    #[error("Resolver timed out after {timeout_secs}s")]
    ResolverTimeout { timeout_secs: u64 },

    #[error("Resolver exited abnormally ({status}): {diagnostics}")]
    ResolverCrash { status: String, diagnostics: String },

    #[error("Resolver produced different lockfiles for identical input ({first} != {second})")]
    NonDeterministicResolution { first: String, second: String },

    // Build errors
    #[error("Image build failed for {image}:\n{log}")]
    BuildFailed { image: String, log: String },

    #[error("Another build of {fingerprint} is in progress")]
    BuildInProgress { fingerprint: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("No cache entry for '{query}': {reason}")]
    CacheEntryNotFound { query: String, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown {kind} backend '{name}' (available: {available})")]
    UnknownBackend {
        kind: &'static str,
        name: String,
        available: String,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// A pipeline failure carried up to the CLI
    #[error(transparent)]
    Stage(Box<StageError>),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StageError> for UvImageError {
    fn from(err: StageError) -> Self {
        Self::Stage(Box::new(err))
    }
}

impl UvImageError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a spec validation error for a named field
    pub fn spec_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpecInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if the caller may retry the request unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ResolverTimeout { .. } | Self::BuildInProgress { .. } => true,
            Self::Stage(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::SpecInvalid { .. } => Some("Fix the named field in the environment spec"),
            Self::Unsatisfiable { .. } => Some("Relax or remove one of the conflicting constraints"),
            Self::ResolverTimeout { .. } => {
                Some("Retry later or raise resolver.timeout_secs in config.toml")
            }
            Self::NonDeterministicResolution { .. } => {
                Some("Pin the index URL and resolver version; cached images may be stale")
            }
            Self::PlatformMismatch { .. } => {
                Some("Set `platform` in the spec to one the packages publish wheels for")
            }
            Self::BuildInProgress { .. } => Some("Wait for the running build and retry"),
            Self::CommandFailed { .. } => Some("Is the resolver/builder binary installed and on PATH?"),
            Self::ConfigInvalid { .. } => Some("Run `uvimage config init --force` to reset it"),
            Self::UnknownBackend { .. } => Some("Check the backend names in config.toml"),
            Self::CacheEntryNotFound { .. } => Some("Run `uvimage cache list` to see cached fingerprints"),
            Self::Stage(err) => err.hint(),
            _ => None,
        }
    }
}

/// Pipeline stage a failure originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    Fingerprint,
    Resolve,
    Plan,
    Build,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normalize => "normalize",
            Self::Fingerprint => "fingerprint",
            Self::Resolve => "resolve",
            Self::Plan => "plan",
            Self::Build => "build",
        };
        write!(f, "{}", name)
    }
}

/// A pipeline failure with the stage and fingerprint it belongs to.
///
/// `fingerprint` is `None` only when the failure happened before one could
/// be computed: normalization, or querying the resolver and builder versions.
#[derive(Error, Debug)]
#[error("{stage} stage failed (fingerprint {}): {source}", fingerprint_label(.fingerprint))]
pub struct StageError {
    pub stage: Stage,
    pub fingerprint: Option<Fingerprint>,
    #[source]
    pub source: UvImageError,
}

impl StageError {
    pub fn new(stage: Stage, fingerprint: Option<&Fingerprint>, source: UvImageError) -> Self {
        Self {
            stage,
            fingerprint: fingerprint.cloned(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }

    pub fn hint(&self) -> Option<&'static str> {
        self.source.hint()
    }
}

fn fingerprint_label(fingerprint: &Option<Fingerprint>) -> String {
    match fingerprint {
        Some(fp) => fp.short().to_string(),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = UvImageError::spec_invalid("packages[1]", "bad constraint");
        assert!(err.to_string().contains("packages[1]"));
    }

    #[test]
    fn unsatisfiable_lists_conflicts() {
        let err = UvImageError::Unsatisfiable {
            conflicts: vec!["foo==1.0".to_string(), "foo==2.0".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("foo==1.0"));
        assert!(msg.contains("foo==2.0"));
    }

    #[test]
    fn error_retryable() {
        assert!(UvImageError::ResolverTimeout { timeout_secs: 5 }.is_retryable());
        assert!(!UvImageError::ResolverCrash {
            status: "signal".to_string(),
            diagnostics: String::new()
        }
        .is_retryable());
        assert!(!UvImageError::BuildFailed {
            image: "img:x".to_string(),
            log: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn stage_error_names_stage_and_fingerprint() {
        let fp = Fingerprint::from_hex("ab".repeat(32)).unwrap();
        let err = StageError::new(
            Stage::Resolve,
            Some(&fp),
            UvImageError::ResolverTimeout { timeout_secs: 1 },
        );
        let msg = err.to_string();
        assert!(msg.starts_with("resolve stage failed"));
        assert!(msg.contains("abababababab"));
        assert!(err.is_retryable());
    }

    #[test]
    fn stage_error_without_fingerprint() {
        let err = StageError::new(
            Stage::Normalize,
            None,
            UvImageError::spec_invalid("python", "empty"),
        );
        assert!(err.to_string().contains("fingerprint none"));
    }

    #[test]
    fn wrapped_stage_error_keeps_hint_and_retryability() {
        let err: UvImageError = StageError::new(
            Stage::Build,
            None,
            UvImageError::BuildInProgress {
                fingerprint: "ab".repeat(32),
            },
        )
        .into();
        assert!(err.is_retryable());
        assert_eq!(err.hint(), Some("Wait for the running build and retry"));
        assert!(err.to_string().starts_with("build stage failed"));
    }
}
