//! # STP Harvest CLI (`harvest`)
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the output tree, scratch area and completion ledger |
//! | `harvest run` | Run the pipeline until interrupted |
//! | `harvest once` | Run exactly one cycle |
//! | `harvest refresh` | Apply waiting identity update batches |
//! | `harvest status` | Show ledger, identity and quarantine counts |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stp_harvest::config::{self, Config, LogFormat};
use stp_harvest::engine::ExternalEngine;
use stp_harvest::identity::{IdentityStore, RefreshOutcome};
use stp_harvest::layout::OutputLayout;
use stp_harvest::ledger::Ledger;
use stp_harvest::pipeline::{CycleOutcome, Harvester};
use stp_harvest::status;

/// STP Harvest: convert bedside monitor recordings to de-identified HDF5.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Convert bedside monitor recordings to de-identified HDF5",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the output tree, scratch area and completion ledger.
    ///
    /// Safe to run repeatedly.
    Init {
        /// Also create an empty identity store if none exists.
        #[arg(long)]
        create_identity_store: bool,
    },

    /// Run the pipeline until interrupted with Ctrl-C.
    Run,

    /// Run a single cycle. Waits in the detector until a file is ready.
    Once,

    /// Apply waiting identity update batches and exit.
    Refresh,

    /// Show ledger, identity, staging and quarantine counts.
    Status {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Logs go to stderr so stdout stays parseable. `RUST_LOG` overrides
/// `logging.level`.
fn init_tracing(cfg: &Config) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.logging.level)
            .with_context(|| format!("Invalid logging.level: {}", cfg.logging.level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match cfg.logging.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg)?;

    match cli.command {
        Commands::Init {
            create_identity_store,
        } => {
            let layout = OutputLayout::new(&cfg);
            layout.ensure()?;
            let ledger = Ledger::open(&cfg.paths.ledger_db()).await?;
            ledger.close().await;
            if create_identity_store {
                IdentityStore::create(&cfg.paths.identity_db).await?.close().await;
            }
            println!("Output tree ready at {}", layout.root().display());
            println!("Completion ledger: {}", cfg.paths.ledger_db().display());
            if create_identity_store {
                println!("Identity store: {}", cfg.paths.identity_db.display());
            }
        }
        Commands::Run => {
            let engine = Arc::new(ExternalEngine::new(&cfg.engine));
            let mut harvester = Harvester::open(cfg, engine).await?;
            harvester.run_forever().await?;
        }
        Commands::Once => {
            let engine = Arc::new(ExternalEngine::new(&cfg.engine));
            let mut harvester = Harvester::open(cfg, engine).await?;
            let outcome = harvester.run_cycle().await;
            harvester.close().await;
            match outcome? {
                CycleOutcome::NoMatches => println!("No files matched patient information."),
                CycleOutcome::NothingDelivered(t) => println!(
                    "Nothing delivered ({} jobs: {} timed out, {} errored).",
                    t.total, t.timed_out, t.errored
                ),
                CycleOutcome::Delivered {
                    tally,
                    delivered,
                    recorded,
                } => println!(
                    "Delivered {} file{} ({} of {} jobs succeeded); {} recorded as completed.",
                    delivered,
                    if delivered == 1 { "" } else { "s" },
                    tally.succeeded,
                    tally.total,
                    recorded
                ),
            }
        }
        Commands::Refresh => {
            let engine = Arc::new(ExternalEngine::new(&cfg.engine));
            let harvester = Harvester::open(cfg, engine).await?;
            let outcome = harvester.refresh_identities().await;
            harvester.close().await;
            match outcome? {
                RefreshOutcome::NoUpdates => println!("No identity updates waiting."),
                RefreshOutcome::Unchanged { batches } => {
                    println!("Read {} update batch(es); identity table unchanged.", batches)
                }
                RefreshOutcome::Replaced {
                    batches,
                    records,
                    requeued,
                } => println!(
                    "Read {} update batch(es); identity table now holds {} records; {} file(s) requeued.",
                    batches, records, requeued
                ),
            }
        }
        Commands::Status { json } => {
            status::run_status(&cfg, json).await?;
        }
    }

    Ok(())
}
