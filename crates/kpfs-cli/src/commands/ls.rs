use anyhow::Result;
use clap::Args as ClapArgs;
use kpfs_core::path;
use tracing::instrument;

use super::format_time;
use crate::session::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Directory within the drive (default: root)
    #[arg(default_value = "/")]
    pub path: String,

    /// Show size and modification time
    #[arg(short, long)]
    pub long: bool,
}

#[instrument(level = "info", name = "cmd::ls", skip_all, fields(path = %args.path))]
pub fn execute(session: &Session, args: &Args) -> Result<()> {
    let dir = path::normalize(&args.path);
    let tree = session.tree();

    for name in tree.read_dir(&dir)? {
        if !args.long {
            println!("{name}");
            continue;
        }
        let stat = tree.stat(&path::join(&dir, &name))?;
        let kind = if stat.is_dir() { 'd' } else { '-' };
        println!(
            "{kind} {:>12} {} {name}",
            stat.size,
            format_time(stat.mtime)
        );
    }
    Ok(())
}
