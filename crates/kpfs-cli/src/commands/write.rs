use std::io::{self, Read};

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use kpfs_cache::{FileCacheEntry, ModifiedState};
use kpfs_core::path;
use tracing::{debug, instrument};

use crate::session::Session;

/// Bytes pulled per step when completing a download before appending.
const DOWNLOAD_STEP: usize = 64 * 1024;

#[derive(ClapArgs)]
pub struct Args {
    /// File path within the drive
    pub file: String,

    /// Append instead of replacing the contents
    #[arg(short, long)]
    pub append: bool,
}

#[instrument(level = "info", name = "cmd::write", skip_all, fields(file = %args.file))]
pub fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = path::normalize(&args.file);
    let mut content = Vec::new();
    io::stdin()
        .read_to_end(&mut content)
        .context("Failed to read stdin")?;

    let entry = if session.tree().get(&path)?.is_some() {
        session.pool.open(&path, libc::O_WRONLY)?
    } else {
        session.pool.create(&path)?
    };

    let written = fill(&entry, &content, args.append);
    session.pool.close(&path)?;
    written.with_context(|| format!("Failed to write {path}"))?;

    debug!(bytes = content.len(), "Wrote file");
    Ok(())
}

fn fill(entry: &FileCacheEntry, content: &[u8], append: bool) -> Result<()> {
    let offset = if append {
        // A write would cancel the download, so fetch the old content first.
        if entry.state() == ModifiedState::Clean {
            while !entry.download(DOWNLOAD_STEP)? {}
        }
        entry.size()
    } else {
        entry.truncate(0)?;
        0
    };
    entry.write(offset, content)?;
    entry.flush()?;
    Ok(())
}
