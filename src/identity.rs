//! Identity directory: source file name → (patient id, time offset).
//!
//! The table lives in an external SQLite file. The pipeline reads it in full
//! once per cycle and replaces it only from [`refresh`], which folds delimited
//! update batches dropped into a watched folder into the table.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::db;
use crate::layout::{self, OutputLayout, Quarantine};
use crate::migrate;
use crate::models::OffsetRow;
use crate::scanner;

const COL_FILE: &str = "STPFile";
const COL_PATIENT: &str = "PatientID";
const COL_OFFSET: &str = "Offset";

pub struct IdentityStore {
    pool: SqlitePool,
}

impl IdentityStore {
    /// Open an existing identity store. The file must exist.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path, false)
            .await
            .with_context(|| format!("Failed to open identity store: {}", path.display()))?;
        migrate::ensure_identity_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Create an empty identity store if none exists.
    pub async fn create(path: &Path) -> Result<Self> {
        let pool = db::connect(path, true).await?;
        migrate::ensure_identity_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Full-table read keyed by file name. When the table holds several rows
    /// for one name, the last inserted wins.
    pub async fn load(&self) -> Result<HashMap<String, OffsetRow>> {
        let rows: Vec<(Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT STPFile, CAST(PatientID AS TEXT), CAST("Offset" AS TEXT)
            FROM PatientOffset
            ORDER BY rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to read PatientOffset table")?;

        let mut table = HashMap::with_capacity(rows.len());
        for (file_name, patient_id, offset) in rows {
            let Some(file_name) = file_name else {
                continue;
            };
            table.insert(
                file_name.clone(),
                OffsetRow {
                    file_name,
                    patient_id,
                    offset,
                },
            );
        }
        Ok(table)
    }

    /// Replace the whole table in one transaction.
    pub async fn replace<'a, I>(&self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a OffsetRow>,
    {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM PatientOffset")
            .execute(&mut *tx)
            .await?;

        for row in rows {
            sqlx::query(r#"INSERT INTO PatientOffset (STPFile, PatientID, "Offset") VALUES (?, ?, ?)"#)
                .bind(&row.file_name)
                .bind(&row.patient_id)
                .bind(&row.offset)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await.context("Failed to commit PatientOffset replacement")?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM PatientOffset")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Parse one update batch: comma-delimited text whose header names the
/// `STPFile`, `PatientID` and `Offset` columns in any order. Rows with an
/// empty required field are dropped.
pub fn parse_delta(text: &str) -> Result<Vec<OffsetRow>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let header = match lines.next() {
        Some(h) => split_fields(h.trim_start_matches('\u{feff}')),
        None => return Ok(Vec::new()),
    };
    let column = |name: &str| -> Result<usize> {
        header
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .with_context(|| format!("update batch has no '{}' column", name))
    };
    let (file_idx, patient_idx, offset_idx) =
        (column(COL_FILE)?, column(COL_PATIENT)?, column(COL_OFFSET)?);

    let mut rows = Vec::new();
    for line in lines {
        let fields = split_fields(line);
        let get = |i: usize| {
            fields
                .get(i)
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty())
        };
        match (get(file_idx), get(patient_idx), get(offset_idx)) {
            (Some(file_name), Some(patient_id), Some(offset)) => rows.push(OffsetRow {
                file_name,
                patient_id: Some(patient_id),
                offset: Some(offset),
            }),
            _ => debug!(line, "dropping incomplete identity update row"),
        }
    }
    Ok(rows)
}

/// Split one record on commas. Double-quoted fields may contain commas, and
/// `""` inside quotes is a literal quote. Records do not span lines.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

/// Fold update rows into a base table. Later rows override earlier ones on
/// file name collision.
pub fn merge_rows<I>(base: &HashMap<String, OffsetRow>, updates: I) -> BTreeMap<String, OffsetRow>
where
    I: IntoIterator<Item = OffsetRow>,
{
    let mut merged: BTreeMap<String, OffsetRow> = base
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for row in updates {
        merged.insert(row.file_name.clone(), row);
    }
    merged
}

/// What a refresh did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// No update batches were waiting.
    NoUpdates,
    /// Batches were consumed but the table did not change.
    Unchanged { batches: usize },
    /// The table was replaced and unmatched files were returned to the
    /// watched root.
    Replaced {
        batches: usize,
        records: usize,
        requeued: usize,
    },
}

/// Consume update batches from `updates_dir` and fold them into the store.
///
/// Batches are applied in file-name order and deleted once the store reflects
/// them. A batch that cannot be parsed is moved to `rejected/` inside the
/// drop folder. When the merged table differs from the stored one it replaces
/// it, and every file quarantined as unmatched is moved back into
/// `input_root` for the next cycle.
pub async fn refresh(
    store: &IdentityStore,
    updates_dir: &Path,
    layout: &OutputLayout,
    input_root: &Path,
) -> Result<RefreshOutcome> {
    let batches: Vec<PathBuf> = layout::list_files(updates_dir)?
        .into_iter()
        .filter(|p| {
            p.extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
        })
        .collect();

    if batches.is_empty() {
        debug!("no identity updates waiting");
        return Ok(RefreshOutcome::NoUpdates);
    }
    info!(count = batches.len(), "identity update batches found");

    let prior = store.load().await?;
    let mut updates = Vec::new();
    let mut consumed = Vec::new();

    for batch in &batches {
        let parsed = std::fs::read_to_string(batch)
            .with_context(|| format!("Failed to read {}", batch.display()))
            .and_then(|text| parse_delta(&text));
        match parsed {
            Ok(rows) => {
                debug!(batch = %batch.display(), rows = rows.len(), "identity batch parsed");
                updates.extend(rows);
                consumed.push(batch.clone());
            }
            Err(e) => {
                warn!(batch = %batch.display(), error = %e, "rejecting identity update batch");
                reject_batch(batch)?;
            }
        }
    }

    let merged = merge_rows(&prior, updates);
    let unchanged = merged.len() == prior.len()
        && merged.iter().all(|(k, v)| prior.get(k) == Some(v));

    let outcome = if unchanged {
        info!("identity updates contained no changes; keeping existing table");
        RefreshOutcome::Unchanged {
            batches: consumed.len(),
        }
    } else {
        store.replace(merged.values()).await?;
        info!(records = merged.len(), "identity table replaced");
        let requeued = requeue_unmatched(layout, input_root)?;
        RefreshOutcome::Replaced {
            batches: consumed.len(),
            records: merged.len(),
            requeued,
        }
    };

    for batch in consumed {
        std::fs::remove_file(&batch)
            .with_context(|| format!("Failed to remove consumed batch {}", batch.display()))?;
    }

    Ok(outcome)
}

fn reject_batch(batch: &Path) -> Result<()> {
    let Some(parent) = batch.parent() else {
        bail!("update batch has no parent directory: {}", batch.display());
    };
    let Some(name) = batch.file_name() else {
        bail!("update batch has no file name: {}", batch.display());
    };
    layout::move_file(batch, &parent.join("rejected").join(name))
}

/// Move every quarantined-as-unmatched source file back into the watched
/// root. Returns how many were moved.
pub fn requeue_unmatched(layout: &OutputLayout, input_root: &Path) -> Result<usize> {
    let matcher = scanner::source_matcher()?;
    let mut moved = 0;
    for path in layout::list_files(&layout.quarantine(Quarantine::NotInPatientDatabase))? {
        let Some(name) = path.file_name() else {
            continue;
        };
        if !matcher.is_match(Path::new(name)) {
            continue;
        }
        layout::move_file(&path, &input_root.join(name))?;
        moved += 1;
    }
    if moved > 0 {
        info!(moved, "returned unmatched files to the watched root");
    }
    Ok(moved)
}
