//! Mitos CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;

use mitos::cli::{commands, BudgetCommands, Cli, Commands};
use mitos::infrastructure::Telemetry;
use mitos::services::ConfigLoader;

#[tokio::main]
async fn main() {
    // Exit code contract: 0 on graceful shutdown, 1 on fatal startup error.
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load().context("Failed to load configuration")?;
    let _telemetry = Telemetry::init(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Serve => commands::handle_serve(config).await,
        Commands::Worker => commands::handle_worker(config).await,
        Commands::Migrate => commands::handle_migrate(config).await,
        Commands::Validate { file } => commands::handle_validate(&file, cli.json),
        Commands::Budget(budget) => match budget {
            BudgetCommands::Show { cell } => commands::handle_budget_show(config, &cell, cli.json).await,
            BudgetCommands::History { cell, limit } => {
                commands::handle_budget_history(config, &cell, limit, cli.json).await
            }
            BudgetCommands::Init { cell, amount } => {
                commands::handle_budget_init(config, &cell, amount, cli.json).await
            }
        },
        Commands::Tree { cell } => commands::handle_tree(config, &cell, cli.json).await,
        Commands::Events { cell, namespace, limit } => {
            commands::handle_events(config, &cell, &namespace, limit, cli.json).await
        }
    }
}
