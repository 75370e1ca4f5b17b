//! Private scratch area for in-flight jobs.
//!
//! Concurrent jobs share one directory, partitioned by source basename: a
//! job owns exactly the entries named `<basename>.<anything>` or
//! `<basename>-_-<anything>`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::engine::{OUTPUT_FORMAT, STAGED_SEPARATOR};
use crate::layout;

/// Whether `file_name` lies in the scratch partition of `basename`.
pub fn belongs_to(basename: &str, file_name: &str) -> bool {
    match file_name.strip_prefix(basename) {
        Some(rest) => rest.starts_with('.') || rest.starts_with(STAGED_SEPARATOR),
        None => false,
    }
}

/// Delete every scratch entry owned by `basename`. Returns how many were
/// removed. Safe to call when nothing is left.
pub fn clear(scratch: &Path, basename: &str) -> Result<usize> {
    let mut removed = 0;
    for path in layout::list_files(scratch)? {
        let owned = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| belongs_to(basename, n));
        if !owned {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove scratch file {}", path.display()))
            }
        }
    }
    if removed > 0 {
        debug!(basename, removed, "scratch cleared");
    }
    Ok(removed)
}

/// Delete every file in the scratch area, logging failures. Used at startup
/// and on interrupt.
pub fn clear_all(scratch: &Path) -> usize {
    let files = match layout::list_files(scratch) {
        Ok(files) => files,
        Err(e) => {
            warn!(error = %e, "could not list scratch area");
            return 0;
        }
    };
    let mut removed = 0;
    for path in files {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove scratch file"),
        }
    }
    removed
}

/// Engine outputs for `basename` sitting in scratch, sorted by name.
pub fn outputs_for(scratch: &Path, basename: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{}{}", basename, STAGED_SEPARATOR);
    Ok(layout::list_files(scratch)?
        .into_iter()
        .filter(|p| {
            let name_ok = p
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix));
            let ext_ok = p
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case(OUTPUT_FORMAT));
            name_ok && ext_ok
        })
        .collect())
}
