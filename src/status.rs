//! Harvest status overview.
//!
//! Summarises the durable state of a deployment: ledger size, identity
//! records, files waiting in staging and scratch, quarantine counts and
//! delivered artifacts. Used by `harvest status`.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::Config;
use crate::identity::IdentityStore;
use crate::layout::{self, OutputLayout, Quarantine};
use crate::ledger::Ledger;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub ledger_entries: i64,
    /// `None` when the identity store file does not exist.
    pub identity_records: Option<i64>,
    pub staged: usize,
    pub in_scratch: usize,
    pub quarantined: BTreeMap<String, usize>,
    pub patients: usize,
    pub delivered: usize,
}

/// Collect the report. Stores that do not exist yet are reported, not created.
pub async fn collect(config: &Config) -> Result<StatusReport> {
    let layout = OutputLayout::new(config);

    let ledger_path = config.paths.ledger_db();
    let ledger_entries = if ledger_path.is_file() {
        let ledger = Ledger::open(&ledger_path).await?;
        let n = ledger.count().await?;
        ledger.close().await;
        n
    } else {
        0
    };

    let identity_records = if config.paths.identity_db.is_file() {
        let store = IdentityStore::open(&config.paths.identity_db).await?;
        let n = store.count().await?;
        store.close().await;
        Some(n)
    } else {
        None
    };

    let quarantined = Quarantine::ALL
        .iter()
        .map(|q| -> Result<(String, usize)> {
            Ok((q.label().to_string(), layout::list_files(&layout.quarantine(*q))?.len()))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    let (patients, delivered) = count_success_tree(&layout.success());

    Ok(StatusReport {
        ledger_entries,
        identity_records,
        staged: layout::list_files(&layout.converted())?.len(),
        in_scratch: layout::list_files(layout.scratch())?.len(),
        quarantined,
        patients,
        delivered,
    })
}

/// Patient directories and files under the success root.
fn count_success_tree(root: &Path) -> (usize, usize) {
    let mut patients = 0;
    let mut files = 0;
    for entry in WalkDir::new(root).min_depth(1).into_iter().flatten() {
        if entry.depth() == 1 && entry.file_type().is_dir() {
            patients += 1;
        } else if entry.file_type().is_file() {
            files += 1;
        }
    }
    (patients, files)
}

/// Run the status command: print the report, as JSON when asked.
pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let report = collect(config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("STP Harvest Status");
    println!("==================");
    println!();
    println!("  Input root:   {}", config.paths.input_root.display());
    println!("  Output root:  {}", config.paths.output_root.display());
    println!();
    println!("  Completed:    {}", report.ledger_entries);
    match report.identity_records {
        Some(n) => println!("  Identities:   {}", n),
        None => println!("  Identities:   (store missing)"),
    }
    println!("  Staged:       {}", report.staged);
    println!("  In scratch:   {}", report.in_scratch);
    println!(
        "  Delivered:    {} file{} for {} patient{}",
        report.delivered,
        if report.delivered == 1 { "" } else { "s" },
        report.patients,
        if report.patients == 1 { "" } else { "s" }
    );
    println!();
    println!("  {:<24} {:>6}", "QUARANTINE", "FILES");
    println!("  {}", "-".repeat(31));
    for (label, count) in &report.quarantined {
        println!("  {:<24} {:>6}", label, count);
    }
    println!();

    Ok(())
}
