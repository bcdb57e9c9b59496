use anyhow::anyhow;
use clap::Parser;

use watchflow::cli::commands;
use watchflow::cli::{Cli, Commands, TrackedAction};
use watchflow::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return commands::init::run_init(force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .map_err(|e| anyhow!("Configuration error: {e}"))?;

    watchflow::logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Config => commands::init::run_config(&settings),
        Commands::Run => commands::run::run(&settings).await,
        Commands::Tracked { action } => match action {
            TrackedAction::List { storage, expired } => {
                commands::tracked::run_list(&settings, storage.as_deref(), expired).await
            }
            TrackedAction::Show { id } => commands::tracked::run_show(&settings, &id).await,
        },
    }
}
