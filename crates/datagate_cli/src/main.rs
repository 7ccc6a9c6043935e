//! datagate CLI
//!
//! Command-line tools for datagate manifests and backends.
//!
//! # Commands
//!
//! - `check` - Load, link and check a manifest
//! - `inspect` - List namespaces, models and properties
//! - `bootstrap` - Create storage for every model
//! - `migrate` - Apply schema changes
//! - `plan` - Print the compiled backend plan of a query

mod commands;
mod error;

use clap::{Parser, Subcommand};
use error::CliResult;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// datagate command-line tools.
#[derive(Parser)]
#[command(name = "datagate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Manifest file or directory, overrides manifest.path
    #[arg(global = true, short, long)]
    manifest: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, link and check a manifest
    Check {
        /// Manifest file or directory
        path: PathBuf,
    },

    /// List namespaces, models and properties
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Create storage for every model
    Bootstrap,

    /// Bring backend schemas in line with the manifest
    Migrate {
        /// Show the planned changes without applying them
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Print the compiled backend plan of a query
    Plan {
        /// Model name
        model: String,

        /// Query expression, e.g. `population>1000&sort(-population)`
        query: Option<String>,
    },

    /// Show version information
    Version,
}

fn run(cli: Cli) -> CliResult<()> {
    let config = || commands::load_config(cli.config.as_deref(), cli.manifest.as_deref());
    match &cli.command {
        Commands::Check { path } => {
            commands::check::run(path)?;
        }
        Commands::Inspect { format } => {
            let manifest = commands::load_configured_manifest(&config()?)?;
            commands::inspect::run(&manifest, format)?;
        }
        Commands::Bootstrap => {
            let store = commands::open_store(config()?)?;
            commands::bootstrap::run(&store)?;
        }
        Commands::Migrate { dry_run } => {
            let store = commands::open_store(config()?)?;
            commands::migrate::run(&store, *dry_run)?;
        }
        Commands::Plan { model, query } => {
            let config = config()?;
            let manifest = commands::load_configured_manifest(&config)?;
            commands::plan::run(&config, &manifest, model, query.as_deref())?;
        }
        Commands::Version => {
            println!("datagate CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            for line in err.lines() {
                eprintln!("{line}");
            }
            err.exit_code()
        }
    }
}
