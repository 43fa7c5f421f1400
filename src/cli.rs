//! CLI entry point. `clap` derive subcommands: `run`, `config`, `doctor`.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "wa-core", version, about = "WhatsApp chat automation orchestration core")]
pub struct Cli {
    /// Root directory holding config/, data/, and logs/.
    #[arg(long, global = true, default_value = ".", env = "WACORE_ROOT")]
    pub root: std::path::PathBuf,

    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the orchestration core: bridge poller, processor, handler registry.
    Run,
    /// Inspect or manage the layered configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run startup diagnostics (config validation, bridge reachability, store health).
    Doctor,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the merged configuration tree.
    Show {
        #[arg(long, default_value = "pretty_json")]
        format: String,
    },
    /// Load and validate without starting the core.
    Validate,
    /// Force a reload from disk.
    Reload,
}
