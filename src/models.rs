//! Core data types that flow through the harvest pipeline.
//!
//! A [`SourceFile`] is found by the stability detector, joined with an
//! [`OffsetRecord`] into a [`MatchedFile`], converted by a job that ends in a
//! [`JobOutcome`], and delivered as one or more [`ConvertedArtifact`]s.

use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A recording found under the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// File name with extension, e.g. `BED1-1000.stp`. Key into the
    /// identity directory and the completion ledger.
    pub file_name: String,
    pub size: u64,
    pub discovered_at: DateTime<Utc>,
}

impl SourceFile {
    pub fn new(path: PathBuf, size: u64, discovered_at: DateTime<Utc>) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            path,
            file_name,
            size,
            discovered_at,
        }
    }

    /// File name without extension. Partitions the scratch area.
    pub fn basename(&self) -> &str {
        basename_of(&self.file_name)
    }
}

/// Strip the final extension from a file name.
pub fn basename_of(file_name: &str) -> &str {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name)
}

/// One size observation held by the stability detector between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSample {
    pub size: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Raw identity-directory row, before numeric coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRow {
    pub file_name: String,
    pub patient_id: Option<String>,
    pub offset: Option<String>,
}

/// Patient identity and time offset for one source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRecord {
    pub patient_id: i64,
    pub offset_seconds: i64,
}

impl OffsetRow {
    /// Coerce the text fields into integers. `None` means the row cannot be
    /// used and the file is treated as unmatched.
    pub fn coerce(&self) -> Option<OffsetRecord> {
        Some(OffsetRecord {
            patient_id: coerce_i64(self.patient_id.as_deref()?)?,
            offset_seconds: coerce_i64(self.offset.as_deref()?)?,
        })
    }
}

/// Parse an integer, accepting integral floats such as `42.0`.
pub fn coerce_i64(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    let f = raw.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// A stable, not-yet-completed source file with its identity attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedFile {
    pub source: SourceFile,
    pub patient_id: i64,
    pub offset_seconds: i64,
}

impl MatchedFile {
    /// Join key against staged artifacts. Same as the scratch partition
    /// and the engine's `%i`: the file name without its final extension.
    pub fn bed_and_seconds(&self) -> &str {
        self.source.basename()
    }
}

/// Lifecycle of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    TimedOut,
    Errored,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::TimedOut | JobState::Errored
        )
    }
}

/// Terminal classification of a conversion job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded(Duration),
    TimedOut,
    Errored(String),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded(_) => JobState::Succeeded,
            JobOutcome::TimedOut => JobState::TimedOut,
            JobOutcome::Errored(_) => JobState::Errored,
        }
    }
}

/// An engine output file sitting in the shared staging area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedArtifact {
    pub staging_path: PathBuf,
    /// Source basename, the join key back to the source file.
    pub bed_and_seconds: String,
    pub bed: String,
    pub raw_epoch_seconds: i64,
    /// Rest of the basename after `<bed>-<rawEpochSeconds>`, with its
    /// leading `.`. Usually empty.
    pub suffix: String,
    pub calendar_date: NaiveDate,
    pub extension: String,
}
