//! viewsync-tap: inspect viewsync behavior from the command line.
//!
//! ## Subcommands
//!
//! - `replay`: Feed an NDJSON event stream through a view and print the page
//! - `follow`: Connect to a live Unix socket channel and print page changes
//! - `check`: Evaluate permissions for an ad-hoc subject

mod check;
#[cfg(unix)]
mod follow;
mod logging;
mod replay;
mod view_args;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "viewsync-tap")]
#[command(about = "Replay, follow and authorize viewsync event streams")]
#[command(version)]
struct Cli {
    /// Write logs to a file in this directory instead of stderr
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Config file (defaults to ~/.viewsync/sync.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply events to a seeded view and print the resulting page
    Replay(replay::ReplayArgs),

    /// Follow a live channel over a Unix socket
    #[cfg(unix)]
    Follow(follow::FollowArgs),

    /// Check whether a subject holds the required permissions
    Check(check::CheckArgs),
}

fn main() {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.log_dir.as_deref());

    let result = match cli.command {
        Commands::Replay(args) => replay::run(&args, cli.config),
        #[cfg(unix)]
        Commands::Follow(args) => follow::run(&args, cli.config),
        Commands::Check(args) => match check::run(&args) {
            Ok(true) => Ok(()),
            Ok(false) => std::process::exit(1),
            Err(err) => Err(err),
        },
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "viewsync-tap failed");
        eprintln!("viewsync-tap: {err}");
        std::process::exit(2);
    }
}
