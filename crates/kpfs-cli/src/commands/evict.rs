use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use kpfs_cache::evict_stale;
use tracing::instrument;

use crate::config::Settings;

#[derive(ClapArgs)]
pub struct Args {
    /// Remove files not accessed for this long (default: the configured retention)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub older_than: Option<Duration>,
}

#[instrument(level = "info", name = "cmd::evict", skip_all)]
pub fn execute(settings: &Settings, args: &Args) -> Result<()> {
    let retention = args.older_than.unwrap_or(settings.cache.retention);
    if !settings.cache_dir.exists() {
        println!("Cache directory {} does not exist", settings.cache_dir.display());
        return Ok(());
    }

    let report = evict_stale(&settings.cache_dir, retention, SystemTime::now())
        .with_context(|| format!("Failed to sweep {}", settings.cache_dir.display()))?;
    println!(
        "Removed {} files and {} directories ({} freed)",
        report.files_removed,
        report.dirs_removed,
        format_bytes(report.bytes_freed)
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
