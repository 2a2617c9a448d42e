//! ormctx CLI
//!
//! Command-line tools for passivated persistence contexts.
//!
//! # Commands
//!
//! - `inspect` - Display the header and section counts of a stream
//! - `verify` - Check the structure of a stream
//! - `dump` - Print the items of a stream for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ormctx command-line stream tools.
#[derive(Parser)]
#[command(name = "ormctx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a passivated persistence context
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
    /// Display the header and section counts of a stream
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check the structure of a stream
    Verify,

    /// Print the items of a stream for debugging
    Dump {
        /// Only dump this table or section
        #[arg(short, long)]
        section: Option<String>,

        /// Maximum number of items per table or section
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Stream path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Stream path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Dump {
            section,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Stream path required for dump")?;
            commands::dump::run(&path, section.as_deref(), limit, &format)?;
        }
        Commands::Version => {
            println!("ormctx CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("ormctx core v{}", ormctx_core::VERSION);
        }
    }

    Ok(())
}
