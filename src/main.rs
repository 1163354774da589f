//! uvimage - reproducible container images for Python environments
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uvimage::cli::commands;
use uvimage::cli::{Cli, Commands};
use uvimage::config::{Config, ConfigManager};
use uvimage::error::UvImageResult;
use uvimage::ui::UiContext;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> UvImageResult<()> {
    let cli = Cli::parse();

    // Completions need neither config nor logging
    if let Commands::Completions { shell } = cli.command {
        commands::completions(shell);
        return Ok(());
    }

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config);
    debug!("Config: {}", config_manager.path().display());

    let ctx = if cli.plain {
        UiContext::non_interactive()
    } else {
        UiContext::detect()
    };

    match cli.command {
        Commands::Completions { .. } => Ok(()),
        Commands::Build(args) => commands::build(args, &config, &ctx).await,
        Commands::Fingerprint(args) => commands::fingerprint(args, &config, &ctx).await,
        Commands::Lock(args) => commands::lock(args, &config, &ctx).await,
        Commands::Plan(args) => commands::plan(args, &config, &ctx).await,
        Commands::Cache(args) => commands::cache(args, &config, &ctx).await,
        Commands::Config(args) => commands::config(args, &config_manager, &config, &ctx).await,
    }
}

/// 0 = warn (progress bars only), 1 = info, 2+ = debug; logs go to stderr
fn init_logging(verbose: u8, config: &Config) {
    let level = match verbose {
        0 if config.general.verbose => "info",
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::new(format!("uvimage={}", level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
