//! Stability detector.
//!
//! Decides when a recording has finished arriving in the watched tree: a file
//! is stable once two size observations taken a poll interval apart are
//! equal. Stable files already listed in the completion ledger are moved to
//! the `AlreadyDone` quarantine instead of being returned.

use anyhow::{Context, Result};
use chrono::Utc;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::layout::{OutputLayout, Quarantine};
use crate::ledger::Ledger;
use crate::models::{SizeSample, SourceFile};

/// Recording file pattern, matched case-insensitively (`.stp`, `.Stp`, `.xtp`...).
pub const SOURCE_PATTERN: &str = "*.?tp";

/// Glob matcher for recording files, applied to paths relative to the root.
pub fn source_matcher() -> Result<GlobSet> {
    let glob = GlobBuilder::new(&format!("**/{}", SOURCE_PATTERN))
        .case_insensitive(true)
        .literal_separator(true)
        .build()?;
    let top = GlobBuilder::new(SOURCE_PATTERN)
        .case_insensitive(true)
        .literal_separator(true)
        .build()?;
    let mut builder = GlobSetBuilder::new();
    builder.add(glob);
    builder.add(top);
    Ok(builder.build()?)
}

/// Size of every matching file under `root`. Files that disappear while the
/// tree is walked are skipped.
pub fn snapshot(root: &Path, matcher: &GlobSet) -> Result<HashMap<PathBuf, SizeSample>> {
    let mut sizes = HashMap::new();

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if is_not_found(&e) => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to walk {}", root.display()))
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if !matcher.is_match(relative) {
            continue;
        }

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) if is_not_found(&e) => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", path.display()))
            }
        };
        sizes.insert(
            path.to_path_buf(),
            SizeSample {
                size,
                sampled_at: Utc::now(),
            },
        );
    }

    Ok(sizes)
}

fn is_not_found(e: &walkdir::Error) -> bool {
    e.io_error()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

/// Signed size change between two observations, `after − before`.
pub fn size_change(before: &SizeSample, after: &SizeSample) -> i64 {
    after.size as i64 - before.size as i64
}

/// Files present in both snapshots with no size change, sorted by path.
pub fn stable_files(
    before: &HashMap<PathBuf, SizeSample>,
    after: &HashMap<PathBuf, SizeSample>,
) -> Vec<SourceFile> {
    let mut stable: Vec<SourceFile> = after
        .iter()
        .filter_map(|(path, latest)| {
            let initial = before.get(path)?;
            (size_change(initial, latest) == 0)
                .then(|| SourceFile::new(path.clone(), latest.size, latest.sampled_at))
        })
        .collect();
    stable.sort_by(|a, b| a.path.cmp(&b.path));
    stable
}

pub struct StabilityDetector<'a> {
    root: &'a Path,
    layout: &'a OutputLayout,
    poll_interval: Duration,
    matcher: GlobSet,
}

impl<'a> StabilityDetector<'a> {
    pub fn new(root: &'a Path, layout: &'a OutputLayout, poll_interval: Duration) -> Result<Self> {
        Ok(Self {
            root,
            layout,
            poll_interval,
            matcher: source_matcher()?,
        })
    }

    /// Block until at least one stable, not-yet-completed file exists and
    /// return all of them.
    pub async fn wait_for_candidates(&self, ledger: &Ledger) -> Result<Vec<SourceFile>> {
        info!(root = %self.root.display(), "searching for files");
        let mut baseline = self.snapshot().await?;

        loop {
            tokio::time::sleep(self.poll_interval).await;
            let latest = self.snapshot().await?;

            let stable = stable_files(&baseline, &latest);
            debug!(
                seen = latest.len(),
                stable = stable.len(),
                "size snapshot compared"
            );

            if !stable.is_empty() {
                let fresh = self.exclude_completed(stable, ledger).await?;
                if !fresh.is_empty() {
                    info!(count = fresh.len(), "new files ready to be converted");
                    return Ok(fresh);
                }
            }

            info!(
                retry_in = %format_wait(self.poll_interval),
                "no new files ready to be converted"
            );
            baseline = latest;
        }
    }

    async fn snapshot(&self) -> Result<HashMap<PathBuf, SizeSample>> {
        let root = self.root.to_path_buf();
        let matcher = self.matcher.clone();
        tokio::task::spawn_blocking(move || snapshot(&root, &matcher)).await?
    }

    /// Drop files already in the ledger, moving them to `AlreadyDone`.
    async fn exclude_completed(
        &self,
        stable: Vec<SourceFile>,
        ledger: &Ledger,
    ) -> Result<Vec<SourceFile>> {
        let completed = ledger.names().await?;
        let (done, fresh): (Vec<_>, Vec<_>) = stable
            .into_iter()
            .partition(|f| completed.contains(&f.file_name));

        if !done.is_empty() {
            info!(
                count = done.len(),
                "files were already converted; moving them to the skipped folder"
            );
        }
        for file in done {
            match self.layout.quarantine_file(&file.path, Quarantine::AlreadyDone) {
                Ok(dest) => debug!(file = %file.file_name, dest = %dest.display(), "already done"),
                Err(e) => warn!(file = %file.file_name, error = %e, "could not move completed file"),
            }
        }

        Ok(fresh)
    }
}

/// Render a wait as `D DAYS; H HOURS; M MIN; S SEC;`.
pub fn format_wait(wait: Duration) -> String {
    let secs = wait.as_secs();
    format!(
        "{} DAYS; {} HOURS; {} MIN; {} SEC;",
        secs / 86_400,
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}
