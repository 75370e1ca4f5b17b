//! Identity merger: attaches patient id and offset to candidate files.
//!
//! The join itself ([`join_offsets`]) is a pure left hash join on file name.
//! [`merge_with_identities`] applies it and moves every unmatched file into
//! the `NotInPatientDatabase` quarantine before returning the matched set.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::layout::{OutputLayout, Quarantine};
use crate::models::{MatchedFile, OffsetRow, SourceFile};

/// Why a candidate could not be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmatched {
    /// No row for this file name.
    NoRecord,
    /// A row exists but its patient id or offset is not an integer.
    BadRecord,
}

#[derive(Debug, Default)]
pub struct JoinResult {
    pub matched: Vec<MatchedFile>,
    pub unmatched: Vec<(SourceFile, Unmatched)>,
}

/// Left join of candidates against the identity table.
pub fn join_offsets(
    candidates: Vec<SourceFile>,
    table: &HashMap<String, OffsetRow>,
) -> JoinResult {
    let mut result = JoinResult::default();

    for source in candidates {
        match table.get(&source.file_name) {
            None => result.unmatched.push((source, Unmatched::NoRecord)),
            Some(row) => match row.coerce() {
                Some(record) => result.matched.push(MatchedFile {
                    source,
                    patient_id: record.patient_id,
                    offset_seconds: record.offset_seconds,
                }),
                None => result.unmatched.push((source, Unmatched::BadRecord)),
            },
        }
    }

    result
}

/// Join candidates with the identity table and quarantine the misses.
/// Returns the matched subset; an empty result aborts the cycle.
pub fn merge_with_identities(
    candidates: Vec<SourceFile>,
    table: &HashMap<String, OffsetRow>,
    layout: &OutputLayout,
) -> Vec<MatchedFile> {
    info!(
        candidates = candidates.len(),
        records = table.len(),
        "pulling patient information for found files"
    );
    let JoinResult { matched, unmatched } = join_offsets(candidates, table);

    if !unmatched.is_empty() {
        info!(
            count = unmatched.len(),
            "no patient information for some files; moving them to the skipped folder"
        );
    }
    for (source, reason) in unmatched {
        if reason == Unmatched::BadRecord {
            warn!(
                file = %source.file_name,
                "identity record has a non-integer patient id or offset"
            );
        }
        match layout.quarantine_file(&source.path, Quarantine::NotInPatientDatabase) {
            Ok(dest) => debug!(file = %source.file_name, dest = %dest.display(), "quarantined"),
            Err(e) => warn!(file = %source.file_name, error = %e, "could not quarantine unmatched file"),
        }
    }

    matched
}
