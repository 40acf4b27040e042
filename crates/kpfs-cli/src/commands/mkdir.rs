use anyhow::Result;
use clap::Args as ClapArgs;
use kpfs_core::path;
use tracing::instrument;

use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Directory path within the drive
    pub path: String,

    /// Do not fail if the directory exists
    #[arg(short, long)]
    pub parents: bool,
}

#[instrument(level = "info", name = "cmd::mkdir", skip_all, fields(path = %args.path))]
pub fn execute(session: &Session, args: &Args) -> Result<()> {
    let path = path::normalize(&args.path);
    session.store.mkdir(&path, args.parents)?;
    session.tree().create(&path, true)?;
    Ok(())
}
