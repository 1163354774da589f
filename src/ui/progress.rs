//! Progress indicators with CI fallback

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// Spinner for a single long step (resolving)
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }

    /// Remove the spinner without a final line
    pub fn clear(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.clear();
        }
    }
}

/// Progress bar fed by image builder output.
///
/// Understands Podman's `STEP N/M: INSTRUCTION` lines and BuildKit's plain
/// progress lines (`#7 [3/6] RUN ...`).
pub struct BuildProgress {
    bar: Option<ProgressBar>,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext, label: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(0);
            let template = ProgressStyle::default_bar().template(
                "  {spinner:.cyan} Building {prefix}  {bar:20.cyan/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}",
            );
            // The template is static; fall back to the default style if it ever fails to parse
            if let Ok(template) = template {
                bar.set_style(
                    template
                        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                        .progress_chars("━╸─"),
                );
            }
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(std::time::Duration::from_millis(120));
            Some(bar)
        } else {
            println!("Building {}...", label);
            None
        };
        Self { bar }
    }

    /// Feed one output line
    pub fn on_line(&self, line: String) {
        if let Some((n, total, instruction)) = parse_step_line(&line) {
            match self.bar {
                Some(ref bar) => {
                    bar.set_length(total);
                    bar.set_position(n);
                    bar.set_message(truncate(instruction, 60));
                }
                None => println!("  STEP {}/{}: {}", n, total, instruction),
            }
            return;
        }

        if let Some(ref bar) = self.bar {
            let trimmed = line.trim();
            if !trimmed.is_empty() && !is_build_noise(trimmed) {
                bar.set_message(truncate(trimmed, 60));
            }
        }
    }

    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}

/// Builder bookkeeping lines not worth showing
fn is_build_noise(line: &str) -> bool {
    line.starts_with("--->")
        || line.starts_with("-->")
        || line.starts_with("Removing intermediate")
        || line.starts_with("COMMIT")
        || line.contains("[internal]")
        || line.ends_with(" DONE")
        || line.ends_with(" CACHED")
}

/// Parse a build step line into (step, total, instruction)
fn parse_step_line(line: &str) -> Option<(u64, u64, &str)> {
    if let Some(rest) = line.strip_prefix("STEP ") {
        let (counts, instruction) = rest.split_once(':')?;
        let (n, total) = parse_fraction(counts)?;
        return Some((n, total, instruction.trim()));
    }

    // BuildKit: `#7 [3/6] RUN ...` or `#7 [stage 3/6] RUN ...`
    let rest = line.strip_prefix('#')?;
    let (id, rest) = rest.split_once(' ')?;
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let rest = rest.strip_prefix('[')?;
    let (inside, instruction) = rest.split_once(']')?;
    let counts = inside.rsplit(' ').next()?;
    let (n, total) = parse_fraction(counts)?;
    Some((n, total, instruction.trim()))
}

fn parse_fraction(text: &str) -> Option<(u64, u64)> {
    let (n, total) = text.trim().split_once('/')?;
    Some((n.parse().ok()?, total.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinner_non_interactive() {
        let ctx = UiContext::non_interactive();
        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start("Resolving...");
        spinner.stop_error("Resolution failed");
        spinner.clear();
    }

    #[test]
    fn podman_step_lines() {
        let (n, m, instr) = parse_step_line("STEP 3/9: RUN uv venv --python 3.12 /app/.venv").unwrap();
        assert_eq!((n, m), (3, 9));
        assert_eq!(instr, "RUN uv venv --python 3.12 /app/.venv");
    }

    #[test]
    fn buildkit_step_lines() {
        let (n, m, instr) = parse_step_line("#8 [4/7] COPY requirements.lock /app/").unwrap();
        assert_eq!((n, m), (4, 7));
        assert_eq!(instr, "COPY requirements.lock /app/");

        let (n, m, _) = parse_step_line("#9 [builder 2/5] RUN apt-get update").unwrap();
        assert_eq!((n, m), (2, 5));
    }

    #[test]
    fn other_lines_are_not_steps() {
        assert!(parse_step_line("#1 [internal] load build definition from Dockerfile").is_none());
        assert!(parse_step_line("---> abc123def").is_none());
        assert!(parse_step_line("#12 DONE 0.3s").is_none());
        assert!(parse_step_line("").is_none());
    }

    #[test]
    fn noise_filter() {
        assert!(is_build_noise("--> Using cache abc123"));
        assert!(is_build_noise("COMMIT uvimage:abc"));
        assert!(is_build_noise("#4 [internal] load metadata"));
        assert!(!is_build_noise("Resolved 12 packages in 40ms"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("short", 60), "short");
        let long = "é".repeat(80);
        let cut = truncate(&long, 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn build_progress_non_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = BuildProgress::new(&ctx, "uvimage");
        progress.on_line("STEP 1/5: FROM ghcr.io/astral-sh/uv:python3.12-bookworm-slim".to_string());
        progress.on_line("#5 [2/5] RUN apt-get update".to_string());
        progress.on_line("Installed 12 packages".to_string());
        progress.finish();
    }
}
