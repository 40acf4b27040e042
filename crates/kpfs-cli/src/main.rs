#![deny(unsafe_code)]

mod commands;
mod config;
mod session;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kpfs_cache::CacheError;
use kpfs_core::{RemoteError, TreeError};
use tracing_subscriber::EnvFilter;

use crate::commands::{cat, evict, ls, mkdir, mv, rm, stat, write};
use crate::session::Session;

/// Work with a kpfs drive through the local file cache
#[derive(Parser)]
#[command(name = "kpfs")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # List the drive root
    kpfs --remote ~/drive ls /

    # Read a file (downloads into the cache on first access)
    kpfs --remote ~/drive cat /notes.txt

    # Replace a file's contents from stdin
    echo hello | kpfs --remote ~/drive write /greeting.txt

    # Drop cache files not read in a week
    kpfs evict --older-than 7d
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Directory holding the drive contents
    #[arg(long, env = "KPFS_REMOTE", global = true, value_name = "DIR")]
    remote: Option<PathBuf>,

    /// Local cache directory
    #[arg(long, env = "KPFS_CACHE_DIR", global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Configuration file (default: ~/.config/kpfs/config.toml)
    #[arg(long, env = "KPFS_CONFIG", global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Drive(DriveCommand),

    /// Remove stale files from the cache directory
    Evict(evict::Args),
}

/// Commands that go through the cache pool
#[derive(Subcommand)]
enum DriveCommand {
    /// List directory contents
    Ls(ls::Args),

    /// Print a file's contents
    Cat(cat::Args),

    /// Show file or directory metadata
    Stat(stat::Args),

    /// Write stdin to a file
    Write(write::Args),

    /// Create a directory
    Mkdir(mkdir::Args),

    /// Remove a file or directory
    Rm(rm::Args),

    /// Move or rename a file or directory
    Mv(mv::Args),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if !cli.quiet {
        setup_tracing(cli.verbose);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = config::Settings::resolve(
        cli.config.as_deref(),
        cli.remote.clone(),
        cli.cache_dir.clone(),
    )?;

    match cli.command {
        // Cache maintenance works without a remote.
        Commands::Evict(args) => evict::execute(&settings, &args),
        Commands::Drive(command) => {
            let session = Session::open(&settings)?;
            let result = match command {
                DriveCommand::Ls(args) => ls::execute(&session, &args),
                DriveCommand::Cat(args) => cat::execute(&session, &args),
                DriveCommand::Stat(args) => stat::execute(&session, &args),
                DriveCommand::Write(args) => write::execute(&session, &args),
                DriveCommand::Mkdir(args) => mkdir::execute(&session, &args),
                DriveCommand::Rm(args) => rm::execute(&session, &args),
                DriveCommand::Mv(args) => mv::execute(&session, &args),
            };
            // Pending uploads finish even if the command failed.
            session.finish();
            result
        }
    }
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Maps the error chain to a process exit code.
///
/// Uses the errno of the first typed cache error found, so scripts see
/// `ENOENT` (2) for a missing path, and 1 otherwise.
fn exit_code(e: &anyhow::Error) -> u8 {
    use kpfs_cache::ToErrno;

    for cause in e.chain() {
        let errno = if let Some(err) = cause.downcast_ref::<CacheError>() {
            err.to_errno()
        } else if let Some(err) = cause.downcast_ref::<TreeError>() {
            err.to_errno()
        } else if let Some(err) = cause.downcast_ref::<RemoteError>() {
            err.to_errno()
        } else {
            continue;
        };
        return u8::try_from(errno).unwrap_or(1);
    }
    1
}
