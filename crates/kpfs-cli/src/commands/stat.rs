use anyhow::Result;
use clap::Args as ClapArgs;
use kpfs_core::path;
use tracing::instrument;

use super::format_time;
use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Path within the drive
    pub path: String,
}

#[instrument(level = "info", name = "cmd::stat", skip_all, fields(path = %args.path))]
pub fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = path::normalize(&args.path);
    let stat = session.tree().stat(&path)?;

    println!("  Path: {path}");
    println!("  Type: {}", if stat.is_dir() { "directory" } else { "file" });
    println!("  Size: {}", stat.size);
    println!("  Mode: {:o}", stat.mode);
    println!("Modify: {}", format_time(stat.mtime));
    println!("Change: {}", format_time(stat.ctime));
    if let Some(entry) = session.pool.get(&path) {
        println!(" Cache: {:?} ({} open)", entry.state(), entry.refcount());
    }
    Ok(())
}
