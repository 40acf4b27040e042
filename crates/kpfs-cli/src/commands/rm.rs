use anyhow::{Result, bail};
use clap::Args as ClapArgs;
use kpfs_core::path;
use tracing::instrument;

use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Path within the drive
    pub path: String,

    /// Remove directories and their contents
    #[arg(short, long)]
    pub recursive: bool,

    /// Ignore a missing path
    #[arg(short, long)]
    pub force: bool,
}

#[instrument(level = "info", name = "cmd::rm", skip_all, fields(path = %args.path))]
pub fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = path::normalize(&args.path);
    if path == "/" {
        bail!("Refusing to remove the drive root");
    }

    match session.tree().get(&path)? {
        Some(node) if node.is_dir() && !args.recursive => {
            bail!("{path} is a directory (use -r)");
        }
        None if !args.force => {
            return Err(kpfs_core::TreeError::NotFound { path }.into());
        }
        _ => {}
    }

    session.store.delete(&path, args.force)?;
    session.tree().remove(&path)?;
    session.pool.discard(&path)?;
    Ok(())
}
