//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// uvimage - reproducible container images for Python environments
///
/// Resolves a declarative environment with uv, builds it into an image
/// tagged with a content fingerprint, and never rebuilds an unchanged spec.
#[derive(Parser, Debug)]
#[command(name = "uvimage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "UVIMAGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Plain line output even in a terminal
    #[arg(long, global = true)]
    pub plain: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build images for one or more environment specs (cached by fingerprint)
    Build(BuildArgs),

    /// Print the fingerprint of a spec without resolving or building
    Fingerprint(SpecArgs),

    /// Resolve a spec and print its lockfile
    Lock(LockArgs),

    /// Resolve a spec and print its build plan
    Plan(PlanArgs),

    /// Inspect the image cache
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Environment spec files (.toml or .json); built concurrently
    #[arg(required = true)]
    pub specs: Vec<PathBuf>,

    /// Override the target platform (e.g. linux/arm64)
    #[arg(long)]
    pub platform: Option<String>,

    /// Output format for the resulting image references
    #[arg(short, long, default_value = "plain")]
    pub format: OutputFormat,
}

/// A single spec file
#[derive(Parser, Debug)]
pub struct SpecArgs {
    /// Environment spec file (.toml or .json)
    pub spec: PathBuf,

    /// Override the target platform (e.g. linux/arm64)
    #[arg(long)]
    pub platform: Option<String>,
}

/// Arguments for the lock command
#[derive(Parser, Debug)]
pub struct LockArgs {
    #[command(flatten)]
    pub spec: SpecArgs,

    /// Write the lockfile here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub spec: SpecArgs,

    /// What to print
    #[arg(short, long, default_value = "dockerfile")]
    pub format: PlanFormat,
}

/// Output format for the plan command
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlanFormat {
    /// Rendered Dockerfile
    Dockerfile,
    /// Build steps as JSON
    Json,
    /// Pinned requirements file
    Requirements,
}

/// Output format for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached images
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show one cache entry and its stored lockfile
    Show {
        /// Fingerprint (full, or a unique prefix of at least 8 characters)
        fingerprint: String,
    },
}
