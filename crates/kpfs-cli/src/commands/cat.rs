use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use kpfs_core::path;
use tracing::instrument;

use crate::session::Session;

/// Bytes requested per read.
const READ_SIZE: usize = 64 * 1024;

#[derive(ClapArgs)]
pub struct Args {
    /// File path within the drive
    pub file: String,
}

#[instrument(level = "info", name = "cmd::cat", skip_all, fields(file = %args.file))]
pub fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = path::normalize(&args.file);
    let entry = session
        .pool
        .open(&path, libc::O_RDONLY)
        .with_context(|| format!("Cannot open {path}"))?;

    let copied = copy_out(&entry, &mut io::stdout().lock());
    session.pool.close(&path)?;
    copied
}

fn copy_out(entry: &kpfs_cache::FileCacheEntry, out: &mut impl Write) -> Result<()> {
    let mut offset = 0u64;
    loop {
        let chunk = entry.read(offset, READ_SIZE)?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    out.flush()?;
    Ok(())
}
