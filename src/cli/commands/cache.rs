//! Cache command - inspect cached images

use crate::cache::{ImageCacheEntry, LockStore};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::{UvImageError, UvImageResult};
use crate::registry::BackendRegistry;
use crate::ui::{self, UiContext};
use console::style;

/// Shortest fingerprint prefix accepted by `cache show`
const MIN_PREFIX_LEN: usize = 8;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config, ctx: &UiContext) -> UvImageResult<()> {
    let store = BackendRegistry::with_defaults().store(config)?;
    let entries = store.list().await?;

    match args.action {
        CacheAction::List { format } => {
            if entries.is_empty() {
                match format {
                    OutputFormat::Json => println!("[]"),
                    OutputFormat::Plain => {}
                    OutputFormat::Table => ui::step_info(ctx, "No cached images"),
                }
                return Ok(());
            }
            match format {
                OutputFormat::Table => print_table(&entries),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                OutputFormat::Plain => {
                    for entry in &entries {
                        println!("{}", entry.image);
                    }
                }
            }
            Ok(())
        }
        CacheAction::Show { fingerprint } => {
            let entry = find_entry(&entries, &fingerprint)?;
            let locks = LockStore::new(ConfigManager::cache_dir(config).join("locks"));
            show_entry(ctx, entry, &locks).await;
            Ok(())
        }
    }
}

fn print_table(entries: &[ImageCacheEntry]) {
    println!(
        "{:<14} {:<17} {:<14} {:<16} {}",
        style("FINGERPRINT").bold(),
        style("BUILT").bold(),
        style("PLATFORM").bold(),
        style("RESOLVER").bold(),
        style("IMAGE").bold()
    );
    println!("{}", "-".repeat(90));

    for entry in entries {
        println!(
            "{:<14} {:<17} {:<14} {:<16} {}",
            entry.fingerprint.short(),
            entry.built_at.format("%Y-%m-%d %H:%M").to_string(),
            entry.platform.to_string(),
            entry.resolver_version,
            entry.image.repository
        );
    }

    println!();
    println!("{} image(s)", entries.len());
}

/// Entry whose fingerprint is `query` or starts with it
fn find_entry<'a>(entries: &'a [ImageCacheEntry], query: &str) -> UvImageResult<&'a ImageCacheEntry> {
    let query = query.trim().to_ascii_lowercase();
    if query.len() < MIN_PREFIX_LEN {
        return Err(UvImageError::CacheEntryNotFound {
            query,
            reason: format!("use at least {} characters", MIN_PREFIX_LEN),
        });
    }

    let matches: Vec<&ImageCacheEntry> = entries
        .iter()
        .filter(|e| e.fingerprint.as_str().starts_with(&query))
        .collect();
    match matches.as_slice() {
        [entry] => Ok(*entry),
        [] => Err(UvImageError::CacheEntryNotFound {
            query,
            reason: "no matching fingerprint".to_string(),
        }),
        many => Err(UvImageError::CacheEntryNotFound {
            query,
            reason: format!("prefix matches {} entries", many.len()),
        }),
    }
}

async fn show_entry(ctx: &UiContext, entry: &ImageCacheEntry, locks: &LockStore) {
    ui::intro(ctx, &entry.image.to_string());
    ui::key_value(ctx, "fingerprint", entry.fingerprint.as_str());
    ui::key_value(ctx, "built", &entry.built_at.to_rfc3339());
    ui::key_value(ctx, "platform", &entry.platform.to_string());
    ui::key_value(ctx, "resolver", &entry.resolver_version);
    ui::key_value(ctx, "builder", &entry.builder_version);

    match locks.read(&entry.fingerprint).await {
        Some(lockfile) => {
            ui::key_value(ctx, "lockfile", &locks.path(&entry.fingerprint).display().to_string());
            println!();
            print!("{}", lockfile);
        }
        None => ui::key_value(ctx, "lockfile", "not stored"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ImageReference;
    use crate::fingerprint::Fingerprint;
    use chrono::Utc;

    fn entry(hex: &str) -> ImageCacheEntry {
        let fingerprint = Fingerprint::from_hex(hex).unwrap();
        ImageCacheEntry {
            image: ImageReference::for_fingerprint("img", &fingerprint),
            fingerprint,
            built_at: Utc::now(),
            resolver_version: "uv 0.5.0".to_string(),
            builder_version: "docker 27.0.1".to_string(),
            platform: Default::default(),
        }
    }

    #[test]
    fn find_by_unique_prefix() {
        let entries = vec![
            entry(&format!("abcd1234{}", "0".repeat(56))),
            entry(&format!("abcd5678{}", "0".repeat(56))),
        ];
        let found = find_entry(&entries, "ABCD1234").unwrap();
        assert!(found.fingerprint.as_str().starts_with("abcd1234"));
    }

    #[test]
    fn short_ambiguous_and_missing_prefixes_fail() {
        let entries = vec![
            entry(&format!("abcd1234{}", "0".repeat(56))),
            entry(&format!("abcd1234{}", "1".repeat(56))),
        ];
        assert!(find_entry(&entries, "abcd").is_err());
        assert!(find_entry(&entries, "abcd1234").is_err());
        assert!(find_entry(&entries, "ffffffff").is_err());
    }
}
