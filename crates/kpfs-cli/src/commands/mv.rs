use anyhow::Result;
use clap::Args as ClapArgs;
use kpfs_core::path;
use tracing::instrument;

use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Source path
    pub source: String,

    /// Destination path
    pub dest: String,
}

#[instrument(level = "info", name = "cmd::mv", skip_all, fields(source = %args.source, dest = %args.dest))]
pub fn execute(session: &Session, args: &Args) -> Result<()> {
    let source = path::normalize(&args.source);
    let dest = path::normalize(&args.dest);
    session.store.move_path(&source, &dest)?;
    session.tree().move_node(&source, &dest)?;
    session.pool.move_path(&source, &dest)?;
    Ok(())
}
