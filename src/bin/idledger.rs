//! idledger maintenance CLI.
//!
//! Every command prints its result as JSON on stdout; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Migrate both stores and apply identifier constraints
//! idledger --data-dir /var/lib/idledger setup
//!
//! # Find duplicates and write JSON + CSV reports
//! idledger scan-duplicates --json --csv
//!
//! # See what a cleanup would do, then do it
//! idledger cleanup --dry-run
//! idledger cleanup --save-report
//! ```
//!
//! Without `--data-dir`, locations come from `IDLEDGER_*` environment
//! variables. `RUST_LOG` controls log verbosity.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use idledger::{CleanupOptions, FinalStatus, Ledger, LedgerConfig, ScanExport};

#[derive(Parser)]
#[command(name = "idledger")]
#[command(author, version, about = "Identity ledger maintenance tools")]
struct Cli {
    /// Directory holding the stores, backups and reports
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate both stores to the ledger schema
    Setup,
    /// Scan both stores for duplicate identifiers
    ScanDuplicates {
        /// Write a JSON report
        #[arg(long)]
        json: bool,

        /// Write a CSV summary
        #[arg(long)]
        csv: bool,
    },
    /// Remove duplicates and link every record to a user
    Cleanup {
        /// Plan only; change nothing
        #[arg(long)]
        dry_run: bool,

        /// Skip identity migration
        #[arg(long)]
        cleanup_only: bool,

        /// Write a migration report
        #[arg(long)]
        save_report: bool,
    },
    /// Identifier quality per store
    QualityMetrics,
    /// User counts
    Stats,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let config = match cli.data_dir {
        Some(dir) => LedgerConfig::in_dir(dir),
        None => LedgerConfig::from_env()?,
    };
    let ledger = Ledger::open(config)?;

    match cli.command {
        Commands::Setup => print_json(&ledger.setup()?)?,
        Commands::ScanDuplicates { json, csv } => {
            print_json(&ledger.scan_duplicates(ScanExport { json, csv })?)?;
        }
        Commands::Cleanup {
            dry_run,
            cleanup_only,
            save_report,
        } => {
            let report = ledger.cleanup(CleanupOptions {
                dry_run,
                cleanup_only,
                save_report,
            })?;
            print_json(&report)?;
            return Ok(!matches!(
                report.status,
                FinalStatus::Failed | FinalStatus::CompletedWithErrors
            ));
        }
        Commands::QualityMetrics => print_json(&ledger.quality_metrics()?)?,
        Commands::Stats => print_json(&ledger.statistics()?)?,
    }
    Ok(true)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("command failed: {e}");
            ExitCode::FAILURE
        }
    }
}
