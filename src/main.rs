//! # Main — CLI entry point
//!
//! Two subcommands:
//!
//! - `serve`: run one API instance. Connects to PostgreSQL, ensures the
//!   schema, wires the session gateway, job tracker, notification router
//!   and quantification orchestrator, then serves HTTP until SIGTERM.
//! - `convert`: offline CSV↔binary conversion of quantification
//!   artifacts. Exit code 0 on success, non-zero on any failure, with
//!   progress reported at INFO.
//!
//! ## Global options
//!
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection string.
//! - `LOG_FORMAT=json`: structured JSON log output for K8s.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "xrfcore", about = "Control plane for planetary XRF spectrometer data")]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an API instance
    Serve {
        /// HTTP listen port
        #[arg(long, default_value_t = 8080, env = "PORT")]
        port: u16,
    },
    /// Convert a quantification between CSV and binary form.
    /// Direction follows the input extension: `.bin` decodes to CSV,
    /// anything else encodes to binary.
    Convert {
        input: PathBuf,
        output: PathBuf,
        /// Scan binary used to re-derive PMCs from beam X/Y/Z columns
        #[arg(long)]
        scan: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize structured logging: LOG_FORMAT=json for K8s, human-readable otherwise
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { port } => {
            let database_url = cli.database_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
            })?;
            cli::run_serve(*port, database_url)
        }
        Commands::Convert {
            input,
            output,
            scan,
        } => cli::run_convert(input, output, scan.as_deref()),
    }
}
