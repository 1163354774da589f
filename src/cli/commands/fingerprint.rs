//! Fingerprint command - show the cache key for a spec

use super::load_spec;
use crate::cli::args::SpecArgs;
use crate::config::Config;
use crate::error::UvImageResult;
use crate::registry::BackendRegistry;
use crate::ui::{self, UiContext};

/// Execute the fingerprint command
pub async fn execute(args: SpecArgs, config: &Config, ctx: &UiContext) -> UvImageResult<()> {
    let spec = load_spec(&args.spec, args.platform.as_deref(), config).await?;
    let pipeline = BackendRegistry::with_defaults().pipeline(config)?;

    let prepared = pipeline.prepare(&spec).await?;
    let cached = pipeline
        .orchestrator()
        .lookup(&prepared.fingerprint)
        .await?;

    if !ctx.use_fancy_output() {
        println!("{}", prepared.fingerprint);
        return Ok(());
    }

    ui::intro(ctx, &args.spec.display().to_string());
    ui::key_value(ctx, "fingerprint", prepared.fingerprint.as_str());
    ui::key_value(ctx, "python", &prepared.spec.python);
    ui::key_value(ctx, "platform", &prepared.spec.platform.to_string());
    ui::key_value(ctx, "resolver", &prepared.resolver_version);
    ui::key_value(ctx, "builder", &prepared.builder_version);
    match cached {
        Some(image) => ui::key_value(ctx, "cached", &image.to_string()),
        None => ui::key_value(ctx, "cached", "no"),
    }
    Ok(())
}
