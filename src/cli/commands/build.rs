//! Build command - materialize specs into images

use super::{interrupted, load_spec};
use crate::cache::ImageReference;
use crate::cli::args::{BuildArgs, OutputFormat};
use crate::config::Config;
use crate::error::{StageError, UvImageResult};
use crate::registry::BackendRegistry;
use crate::ui::{self, BuildProgress, UiContext};
use console::style;
use futures_util::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Serialize)]
struct BuiltImage {
    spec: PathBuf,
    image: String,
    fingerprint: String,
}

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config, ctx: &UiContext) -> UvImageResult<()> {
    let mut specs = Vec::with_capacity(args.specs.len());
    for path in &args.specs {
        specs.push(load_spec(path, args.platform.as_deref(), config).await?);
    }

    let mut pipeline = BackendRegistry::with_defaults().pipeline(config)?;
    if args.format == OutputFormat::Table {
        ui::intro(ctx, "uvimage build");
    }

    // One spec gets a live progress bar, created on the first builder line
    // so cache hits print nothing
    let progress: Arc<OnceLock<BuildProgress>> = Arc::new(OnceLock::new());
    if let [path] = args.specs.as_slice() {
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let bar = Arc::clone(&progress);
        let bar_ctx = ctx.clone();
        pipeline = pipeline.with_build_output(Arc::new(move |line: String| {
            bar.get_or_init(|| BuildProgress::new(&bar_ctx, &label))
                .on_line(line);
        }));
    }

    let results: Vec<Result<ImageReference, StageError>> = join_all(
        specs
            .iter()
            .map(|spec| pipeline.materialize_until(spec, interrupted())),
    )
    .await;

    if let Some(bar) = progress.get() {
        bar.finish();
    }

    let mut built = Vec::new();
    let mut first_error = None;
    for (path, result) in args.specs.iter().zip(results) {
        match result {
            Ok(image) => {
                if args.format == OutputFormat::Table {
                    ui::step_ok_detail(ctx, &image.to_string(), &path.display().to_string());
                }
                built.push(BuiltImage {
                    spec: path.clone(),
                    fingerprint: image.tag.clone(),
                    image: image.to_string(),
                });
            }
            Err(e) => {
                if args.specs.len() > 1 {
                    eprintln!("{} {}: {}", style("Failed:").red(), path.display(), e);
                }
                first_error.get_or_insert(e);
            }
        }
    }

    match args.format {
        OutputFormat::Plain => {
            for image in &built {
                println!("{}", image.image);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&built)?),
        OutputFormat::Table => {
            let failed = args.specs.len() - built.len();
            if failed == 0 {
                ui::outro_success(ctx, &format!("Built {} image(s)", built.len()));
            } else {
                ui::outro_error(ctx, &format!("{} of {} spec(s) failed", failed, args.specs.len()));
            }
        }
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
