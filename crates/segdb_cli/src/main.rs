//! segdb CLI
//!
//! Command-line tools for segdb store maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display store geometry, segments and load
//! - `verify` - Check that every mapped record can be read back
//! - `compact` - Run one compaction pass and release migrated segments
//! - `get` - Print the record stored at an index

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// segdb command-line store tools.
#[derive(Parser)]
#[command(name = "segdb")]
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

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store geometry, segments and load
    Inspect {
        /// Show one line per segment
        #[arg(short, long)]
        segments: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Check that every mapped record can be read back
    Verify,

    /// Run one compaction pass
    Compact {
        /// Only list the segments a pass would consider
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Print the record stored at an index
    Get {
        /// Index to read
        index: usize,

        /// Print the payload as hex instead of text
        #[arg(long)]
        hex: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { segments, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, segments, format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Get { index, hex } => {
            let path = cli.path.ok_or("Store path required for get")?;
            commands::get::run(&path, index, hex)?;
        }
        Commands::Version => {
            println!("segdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("segdb core v{}", segdb_core::VERSION);
        }
    }

    Ok(())
}
