//! Idempotent schema setup for the two SQLite stores.
//!
//! Table and column names match the stores written by earlier deployments,
//! so existing ledgers and identity databases open unchanged.

use anyhow::Result;
use sqlx::SqlitePool;

/// Completion ledger: one row per delivered source file name.
pub async fn ensure_ledger_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS CompletedFiles (
            CompletedFiles TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_completed_files_name ON CompletedFiles(CompletedFiles)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Identity directory: source file name → patient id and offset. Numeric
/// columns carry no declared type so rows written as text or integers both
/// read back.
pub async fn ensure_identity_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS PatientOffset (
            STPFile TEXT,
            PatientID,
            "Offset"
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
