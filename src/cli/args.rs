//! CLI argument parsing using clap.
//!
//! Contains the Cli struct, Commands enum, and all subcommand enums.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Watch folders and emit synchronisation workflows
#[derive(Parser, Debug)]
#[command(
    name = "watchflow",
    version = env!("CARGO_PKG_VERSION"),
    about = "Watch folders and emit synchronisation workflows",
    long_about = "Watch source storages, track their files in a ledger and emit copy/delete workflows for their destinations.",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Examples:\n  watchflow init\n  watchflow run\n  watchflow tracked list --storage ingest\n  watchflow tracked show clips/a.mxf"
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize project
    #[command(about = "Set up .watchflow directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings from .watchflow/settings.toml")]
    Config,

    /// Run the watch folder generator until interrupted
    #[command(
        about = "Watch configured storages and emit workflows",
        long_about = "Open the ledger, start watching every configured flow and write emitted workflows as JSON lines until Ctrl-C."
    )]
    Run,

    /// Inspect the ledger
    #[command(about = "Inspect tracked items in the ledger")]
    Tracked {
        #[command(subcommand)]
        action: TrackedAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum TrackedAction {
    /// List tracked items
    List {
        /// Only items sourced from this storage
        #[arg(short, long)]
        storage: Option<String>,

        /// Only items past their linger time
        #[arg(long)]
        expired: bool,
    },

    /// Show one tracked item
    Show {
        /// Item id (the file's path on its source storage)
        id: String,
    },
}
