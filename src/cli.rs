/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use stack_cli::core::prompt::Decision;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "stack-cli")]
#[command(author, version = VERSION_WITH_BUILD, about = "Back up, restore and start the self-hosted n8n stack", long_about = None)]
pub struct Cli {
    /// Directory holding the service compose directories
    #[arg(long, global = true, value_name = "DIR")]
    pub project_root: Option<PathBuf>,

    /// Backup directory (default: <project-root>/backups)
    #[arg(long, global = true, value_name = "DIR")]
    pub backup_root: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Back up services (all when none are named)
    Backup {
        /// Services to back up
        services: Vec<String>,

        /// Stop services for a consistent volume snapshot
        #[arg(long, value_enum, default_value_t = Decision::Ask)]
        stop: Decision,

        /// Bundle the instances into a single archive
        #[arg(long, value_enum, default_value_t = Decision::Ask)]
        bundle: Decision,

        /// Restart services that were stopped
        #[arg(long, value_enum, default_value_t = Decision::Ask)]
        restart: Decision,
    },

    /// Restore services from the newest backup source
    Restore {
        /// Services to restore (offered interactively when omitted)
        services: Vec<String>,

        /// Confirm the overwrite without prompting
        #[arg(long)]
        yes: bool,

        /// Start the stopped services afterwards
        #[arg(long, value_enum, default_value_t = Decision::Ask)]
        start: Decision,
    },

    /// Start services in dependency order (all when none are named)
    Start {
        /// Services to start
        services: Vec<String>,
    },

    /// Show available backups and what a restore would use
    List,
}
