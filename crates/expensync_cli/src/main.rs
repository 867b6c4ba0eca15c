//! Expensync CLI
//!
//! Command-line tools for expensync store directories.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and metadata
//! - `queue` - List operations waiting for the remote
//! - `dead-letters` - List, requeue or discard abandoned operations
//! - `verify` - Check journal integrity without opening the store
//! - `compact` - Rewrite the journal as a snapshot

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Expensync store maintenance tools.
#[derive(Parser)]
#[command(name = "expensync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and metadata
    Inspect {
        /// Show record counts per collection
        #[arg(short, long)]
        collections: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List operations waiting for the remote
    Queue {
        /// Maximum number of operations to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Manage abandoned operations
    DeadLetters {
        #[command(subcommand)]
        action: Option<DeadLetterAction>,
    },

    /// Check journal integrity
    Verify,

    /// Rewrite the journal as a snapshot of the current state
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead letters (default)
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Put a dead letter back at the end of the queue
    Requeue {
        /// Queue position of the abandoned operation
        operation_id: u64,
    },

    /// Delete a dead letter
    Discard {
        /// Queue position of the abandoned operation
        operation_id: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            collections,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, collections, &format)?;
        }
        Commands::Queue { limit, format } => {
            let path = cli.path.ok_or("Store path required for queue")?;
            commands::queue::run(&path, limit, &format)?;
        }
        Commands::DeadLetters { action } => {
            let path = cli.path.ok_or("Store path required for dead-letters")?;
            match action.unwrap_or(DeadLetterAction::List {
                format: "text".to_string(),
            }) {
                DeadLetterAction::List { format } => commands::dead_letters::list(&path, &format)?,
                DeadLetterAction::Requeue { operation_id } => {
                    commands::dead_letters::requeue(&path, operation_id)?
                }
                DeadLetterAction::Discard { operation_id } => {
                    commands::dead_letters::discard(&path, operation_id)?
                }
            }
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("Expensync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Expense tracker schema v{}",
                expensync_core::EXPENSE_TRACKER_VERSION
            );
        }
    }

    Ok(())
}
