//! De-identification renamer.
//!
//! The engine names its outputs `<bed>-<rawEpochSeconds>-_-<YYYY-MM-DD>.<ext>`.
//! Each staged artifact is joined back to its matched source on the source
//! basename, its date and start time are shifted, and it is
//! moved to
//!
//! ```text
//! Success/<patientId>/<prefix>_<patientId>_<days>_<bed>-<seconds>_<tag>.<ext>
//! ```
//!
//! where `days` counts whole days since the configured anchor, `seconds` is
//! the raw start minus the file's offset, and `tag` is `V` (`VW` when wave
//! data was kept).

use anyhow::Result;
use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::NamingConfig;
use crate::engine::{OUTPUT_FORMAT, STAGED_SEPARATOR};
use crate::layout::{self, OutputLayout};
use crate::models::{ConvertedArtifact, MatchedFile};

/// Parse a staged file name. `None` when it does not follow the engine's
/// naming pattern.
///
/// The key before the separator is the source basename, which may itself
/// contain dots (`BED1-1000.v2-_-2024-01-01.hdf5`). Bed and start time come
/// from the key up to its first `.`.
pub fn parse_staged_name(path: &Path) -> Option<ConvertedArtifact> {
    let file_name = path.file_name()?.to_str()?;
    let (bed_and_seconds, rest) = file_name.rsplit_once(STAGED_SEPARATOR)?;
    let (date, extension) = rest.rsplit_once('.')?;
    let (stamp, suffix) = match bed_and_seconds.find('.') {
        Some(i) => bed_and_seconds.split_at(i),
        None => (bed_and_seconds, ""),
    };
    let (bed, seconds) = stamp.rsplit_once('-')?;
    if bed.is_empty() || extension.is_empty() || suffix == "." {
        return None;
    }

    let raw_epoch_seconds = seconds.parse::<i64>().ok()?;
    let calendar_date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date, "%Y%m%d"))
        .ok()?;

    Some(ConvertedArtifact {
        staging_path: path.to_path_buf(),
        bed_and_seconds: bed_and_seconds.to_string(),
        bed: bed.to_string(),
        raw_epoch_seconds,
        suffix: suffix.to_string(),
        calendar_date,
        extension: extension.to_string(),
    })
}

/// Whole days from `anchor` to `date`.
pub fn deidentified_days(date: NaiveDate, anchor: NaiveDate) -> i64 {
    (date - anchor).num_days()
}

pub fn deidentified_seconds(raw_epoch_seconds: i64, offset_seconds: i64) -> i64 {
    raw_epoch_seconds.saturating_sub(offset_seconds)
}

/// File name tag recording whether wave data was kept.
pub fn info_tag(wave_data: bool) -> &'static str {
    if wave_data {
        "VW"
    } else {
        "V"
    }
}

/// Final de-identified file name for one artifact.
pub fn deidentified_file_name(
    naming: &NamingConfig,
    artifact: &ConvertedArtifact,
    patient_id: i64,
    offset_seconds: i64,
    wave_data: bool,
) -> String {
    let days = deidentified_days(artifact.calendar_date, naming.epoch_anchor);
    format!(
        "{}_{}_{:0width$}_{}-{}{}_{}.{}",
        naming.prefix,
        patient_id,
        days,
        artifact.bed,
        deidentified_seconds(artifact.raw_epoch_seconds, offset_seconds),
        artifact.suffix,
        info_tag(wave_data),
        artifact.extension,
        width = naming.date_width
    )
}

/// Path under the success root, `<patientId>/<name>`.
pub fn success_path(
    layout: &OutputLayout,
    naming: &NamingConfig,
    artifact: &ConvertedArtifact,
    file: &MatchedFile,
    wave_data: bool,
) -> PathBuf {
    layout
        .success()
        .join(file.patient_id.to_string())
        .join(deidentified_file_name(
            naming,
            artifact,
            file.patient_id,
            file.offset_seconds,
            wave_data,
        ))
}

fn is_staged_artifact(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(OUTPUT_FORMAT))
}

/// Move every staged artifact into the success tree.
///
/// Returns the source names with at least one delivered artifact, or `None`
/// when the staging area holds no artifacts at all. Artifacts that cannot be
/// parsed or have no matched source are left in staging with a warning.
pub fn relocate_staged(
    layout: &OutputLayout,
    matched: &[MatchedFile],
    naming: &NamingConfig,
    wave_data: bool,
) -> Result<Option<BTreeSet<String>>> {
    let staged: Vec<PathBuf> = layout::list_files(&layout.converted())?
        .into_iter()
        .filter(|p| is_staged_artifact(p))
        .collect();
    if staged.is_empty() {
        info!("no converted files to de-identify");
        return Ok(None);
    }

    let by_key: HashMap<&str, &MatchedFile> =
        matched.iter().map(|m| (m.bed_and_seconds(), m)).collect();

    let mut delivered = BTreeSet::new();
    let mut moved = 0usize;

    for path in staged {
        let Some(artifact) = parse_staged_name(&path) else {
            warn!(path = %path.display(), "unrecognised staged file name; left in staging");
            continue;
        };
        let Some(file) = by_key.get(artifact.bed_and_seconds.as_str()) else {
            warn!(
                path = %path.display(),
                key = %artifact.bed_and_seconds,
                "staged file has no matched source this cycle; left in staging"
            );
            continue;
        };

        let dest = success_path(layout, naming, &artifact, file, wave_data);
        match layout::move_file(&artifact.staging_path, &dest) {
            Ok(()) => {
                debug!(
                    from = %artifact.staging_path.display(),
                    to = %dest.display(),
                    "artifact delivered"
                );
                moved += 1;
                delivered.insert(file.source.file_name.clone());
            }
            Err(e) => warn!(path = %path.display(), error = %e, "could not deliver artifact"),
        }
    }

    info!(
        artifacts = moved,
        sources = delivered.len(),
        "de-identified files moved to the success folder"
    );
    Ok(Some(delivered))
}
