//! Completion ledger.
//!
//! Append-only record of source file names whose conversion has been
//! delivered into the success tree. It is the only guard against
//! reprocessing across restarts, so a batch is appended inside a single
//! transaction: after a crash either the whole batch is visible or none of it.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::db;
use crate::migrate;

pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (creating if needed) the ledger database.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path, true)
            .await
            .with_context(|| format!("Failed to open completion ledger: {}", path.display()))?;
        migrate::ensure_ledger_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Full read of every recorded name.
    pub async fn names(&self) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT CompletedFiles FROM CompletedFiles")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn contains(&self, name: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM CompletedFiles WHERE CompletedFiles = ? LIMIT 1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Append a batch atomically. Names already present are not duplicated.
    /// Returns how many new names were recorded.
    pub async fn append<I, S>(&self, names: I) -> Result<u64>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tx = self.pool.begin().await?;
        let mut added = 0u64;

        for name in names {
            let result = sqlx::query(
                r#"
                INSERT INTO CompletedFiles (CompletedFiles)
                SELECT ?1 WHERE NOT EXISTS (
                    SELECT 1 FROM CompletedFiles WHERE CompletedFiles = ?1
                )
                "#,
            )
            .bind(name.as_ref())
            .execute(&mut *tx)
            .await?;
            added += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit ledger batch")?;
        info!(added, "completion ledger updated");
        Ok(added)
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM CompletedFiles")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
