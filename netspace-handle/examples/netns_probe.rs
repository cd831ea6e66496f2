//! Inspect and manage network namespaces from the command line
//!
//! Run with: cargo run --example netns_probe -- show
//! Run as root: sudo cargo run --example netns_probe -- create probe

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netspace_handle::{NetNs, NetnsConfig, ProcessId, ThreadId};
use std::path::{Path, PathBuf};
use tracing::Level;

#[derive(Parser)]
#[command(name = "netns_probe")]
#[command(about = "Network namespace handle demo", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for created named namespaces
    #[arg(long, global = true, default_value = netspace_handle::DEFAULT_RUN_DIR)]
    run_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the namespace of a process or thread
    Show {
        /// Process ID (default: current process)
        #[arg(short, long)]
        pid: Option<i32>,

        /// Thread ID within the process
        #[arg(short, long, requires = "pid")]
        tid: Option<i32>,
    },

    /// Check whether two namespace files refer to the same namespace
    Compare {
        /// First namespace path
        first: PathBuf,
        /// Second namespace path
        second: PathBuf,
    },

    /// Create a persistent namespace under the run directory
    Create {
        /// Namespace name
        name: String,
    },

    /// Remove a persistent namespace created with `create`
    Remove {
        /// Namespace name
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::TRACE
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = NetnsConfig::new().with_run_dir(&cli.run_dir);

    match cli.command {
        Commands::Show { pid, tid } => show(pid, tid),
        Commands::Compare { first, second } => compare(&first, &second),
        Commands::Create { name } => create(&config, &name),
        Commands::Remove { name } => {
            NetNs::remove_named_in(&config, &name)
                .with_context(|| format!("Failed to remove namespace {name}"))?;
            println!("Removed {}", config.run_dir.join(&name).display());
            Ok(())
        }
    }
}

fn show(pid: Option<i32>, tid: Option<i32>) -> Result<()> {
    let ns = match (pid, tid) {
        (Some(pid), Some(tid)) => {
            NetNs::from_thread(ProcessId::from_raw(pid), ThreadId::from_raw(tid))?
        }
        (Some(pid), None) => NetNs::from_pid(ProcessId::from_raw(pid))?,
        (None, _) => NetNs::current()?,
    };

    let id = ns.id().context("Namespace handle closed unexpectedly")?;
    println!("{}", ns.path().display());
    println!("  identity: {id} (dev {})", id.dev());

    Ok(())
}

fn compare(first: &Path, second: &Path) -> Result<()> {
    let a = NetNs::from_path(first)?;
    let b = NetNs::from_path(second)?;

    if a.is_same(&b) {
        println!("same namespace");
    } else {
        println!("different namespaces");
    }

    Ok(())
}

fn create(config: &NetnsConfig, name: &str) -> Result<()> {
    let ns = NetNs::new_named_on_worker(config, name)
        .with_context(|| format!("Failed to create namespace {name}"))?;

    let id = ns.id().context("Namespace handle closed unexpectedly")?;
    println!("Created {} ({id})", ns.path().display());

    Ok(())
}
