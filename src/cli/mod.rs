//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mitos", about = "Cell-based agent orchestration platform", version)]
pub struct Cli {
    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the control plane: controllers, event consumer, and API
    Serve,

    /// Run one cell worker (configuration from CELL_* environment)
    Worker,

    /// Apply database migrations and exit
    Migrate,

    /// Validate a resource manifest file
    Validate {
        /// Path to a YAML manifest
        #[arg(short, long)]
        file: String,
    },

    /// Budget ledger queries and operations
    #[command(subcommand)]
    Budget(BudgetCommands),

    /// Show a cell's subtree
    Tree {
        /// Cell id at the subtree root
        cell: String,
    },

    /// Show recent events for a cell
    Events {
        cell: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Debug, Subcommand)]
pub enum BudgetCommands {
    /// Show a cell's balance
    Show { cell: String },

    /// Show a cell's journal history
    History {
        cell: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Initialize a root budget account
    Init { cell: String, amount: f64 },
}
