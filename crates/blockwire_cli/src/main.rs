//! blockwire CLI
//!
//! Command-line tools for blockwire logs and servers.
//!
//! # Commands
//!
//! - `dump` - Print log records in order
//! - `verify` - Check record boundaries and replay the log
//! - `tail` - Print the newest records
//! - `serve` - Run a server answering the builtin opcodes

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// blockwire command-line tools.
#[derive(Parser)]
#[command(name = "blockwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print log records in order
    Dump {
        /// Path to the log file
        path: PathBuf,

        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this record offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Check record boundaries in both directions and replay the log
    Verify {
        /// Path to the log file
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Print the newest records, read backward from the end
    Tail {
        /// Path to the log file
        path: PathBuf,

        /// Number of records
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Run a server answering the builtin opcodes
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Speak the raw protocol instead of upgrading websocket clients
        #[arg(long)]
        raw: bool,

        /// Maximum concurrent connections
        #[arg(long, default_value = "1000")]
        max_connections: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Dump {
            path,
            limit,
            offset,
            format,
        } => commands::dump::run(&path, limit, offset, format)?,
        Commands::Verify { path, format } => commands::verify::run(&path, format)?,
        Commands::Tail {
            path,
            count,
            format,
        } => commands::tail::run(&path, count, format)?,
        Commands::Serve {
            bind,
            raw,
            max_connections,
        } => commands::serve::run(bind, raw, max_connections)?,
        Commands::Version => {
            println!("blockwire CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Log format v{}", blockwire_core::FORMAT_VERSION);
        }
    }

    Ok(())
}
