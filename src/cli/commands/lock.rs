//! Lock and plan commands - resolve without building

use super::load_spec;
use crate::cli::args::{LockArgs, PlanArgs, PlanFormat, SpecArgs};
use crate::config::Config;
use crate::error::{UvImageError, UvImageResult};
use crate::pipeline::{Pipeline, Prepared};
use crate::registry::BackendRegistry;
use crate::resolver::LockedGraph;
use crate::ui::{self, TaskSpinner, UiContext};

/// Prepare and resolve a spec with a spinner around the resolver
async fn resolve(
    args: &SpecArgs,
    config: &Config,
    ctx: &UiContext,
) -> UvImageResult<(Pipeline, Prepared, LockedGraph)> {
    let spec = load_spec(&args.spec, args.platform.as_deref(), config).await?;
    let pipeline = BackendRegistry::with_defaults().pipeline(config)?;
    let prepared = pipeline.prepare(&spec).await?;

    // Spinner only in a terminal; the lockfile or plan goes to stdout
    let mut spinner = ctx.use_fancy_output().then(|| TaskSpinner::new(ctx));
    if let Some(spinner) = spinner.as_mut() {
        spinner.start(&format!("Resolving {}", args.spec.display()));
    }

    match pipeline.lock(&prepared).await {
        Ok(graph) => {
            if let Some(spinner) = spinner.as_mut() {
                spinner.clear();
            }
            Ok((pipeline, prepared, graph))
        }
        Err(e) => {
            if let Some(spinner) = spinner.as_mut() {
                spinner.stop_error("Resolution failed");
            }
            Err(e.into())
        }
    }
}

/// Execute the lock command
pub async fn execute_lock(args: LockArgs, config: &Config, ctx: &UiContext) -> UvImageResult<()> {
    let (_, prepared, graph) = resolve(&args.spec, config, ctx).await?;
    let lockfile = graph.to_lockfile()?;

    match args.output {
        Some(path) => {
            tokio::fs::write(&path, lockfile)
                .await
                .map_err(|e| UvImageError::io(format!("writing {}", path.display()), e))?;
            ui::step_ok_detail(
                ctx,
                &format!("Locked {} package(s)", graph.packages.len()),
                &path.display().to_string(),
            );
            ui::remark(ctx, &format!("fingerprint {}", prepared.fingerprint));
        }
        None => print!("{}", lockfile),
    }
    Ok(())
}

/// Execute the plan command
pub async fn execute_plan(args: PlanArgs, config: &Config, ctx: &UiContext) -> UvImageResult<()> {
    let (pipeline, prepared, graph) = resolve(&args.spec, config, ctx).await?;
    let plan = pipeline.plan(&prepared, &graph)?;

    match args.format {
        PlanFormat::Dockerfile => print!("{}", plan.dockerfile()),
        PlanFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        PlanFormat::Requirements => print!("{}", plan.requirements_lock),
    }
    Ok(())
}
