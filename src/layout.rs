//! Output tree layout and the file moves that route sources through it.
//!
//! ```text
//! <output root>/Converted/*                         engine output awaiting de-identification
//! <output root>/Success/<patientId>/<name>          delivered artifacts
//! <output root>/Skipped/AlreadyDone/*               already in the completion ledger
//! <output root>/Skipped/NotInPatientDatabase/*      no identity record
//! <output root>/Failed/TimedOut/*                   conversion exceeded the timeout
//! <output root>/Failed/ErroredOut/*                 conversion failed
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Where a source file goes when it cannot proceed through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quarantine {
    AlreadyDone,
    NotInPatientDatabase,
    TimedOut,
    ErroredOut,
}

impl Quarantine {
    pub const ALL: [Quarantine; 4] = [
        Quarantine::AlreadyDone,
        Quarantine::NotInPatientDatabase,
        Quarantine::TimedOut,
        Quarantine::ErroredOut,
    ];

    fn relative(&self) -> [&'static str; 2] {
        match self {
            Quarantine::AlreadyDone => ["Skipped", "AlreadyDone"],
            Quarantine::NotInPatientDatabase => ["Skipped", "NotInPatientDatabase"],
            Quarantine::TimedOut => ["Failed", "TimedOut"],
            Quarantine::ErroredOut => ["Failed", "ErroredOut"],
        }
    }

    pub fn label(&self) -> &'static str {
        self.relative()[1]
    }
}

/// Resolved absolute directories of the output tree and scratch area.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    scratch: PathBuf,
}

impl OutputLayout {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.paths.output_root.clone(),
            scratch: config.paths.scratch_dir(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    pub fn converted(&self) -> PathBuf {
        self.root.join("Converted")
    }

    pub fn success(&self) -> PathBuf {
        self.root.join("Success")
    }

    pub fn quarantine(&self, kind: Quarantine) -> PathBuf {
        let [a, b] = kind.relative();
        self.root.join(a).join(b)
    }

    /// Create the directories the pipeline writes into. Idempotent.
    pub fn ensure(&self) -> Result<()> {
        let mut dirs = vec![self.scratch.clone(), self.converted(), self.success()];
        dirs.extend(Quarantine::ALL.iter().map(|q| self.quarantine(*q)));
        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Move a source file into a quarantine, keeping its file name.
    pub fn quarantine_file(&self, path: &Path, kind: Quarantine) -> Result<PathBuf> {
        let name = path
            .file_name()
            .with_context(|| format!("Not a file path: {}", path.display()))?;
        let dest = self.quarantine(kind).join(name);
        move_file(path, &dest)?;
        Ok(dest)
    }
}

/// Rename `from` to `to`, creating missing parent directories. Falls back to
/// copy + remove when the rename crosses filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !from.exists() {
                return Err(rename_err)
                    .with_context(|| format!("Failed to move {}", from.display()));
            }
            std::fs::copy(from, to).with_context(|| {
                format!("Failed to copy {} to {}", from.display(), to.display())
            })?;
            std::fs::remove_file(from)
                .with_context(|| format!("Failed to remove {}", from.display()))?;
            Ok(())
        }
    }
}

/// List regular files directly inside `dir`, sorted by path. A missing
/// directory yields an empty list.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read directory: {}", dir.display()))
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(root: &Path) -> OutputLayout {
        OutputLayout {
            root: root.to_path_buf(),
            scratch: root.join("Processing"),
        }
    }

    #[test]
    fn test_quarantine_paths() {
        let l = layout(Path::new("/out"));
        assert_eq!(
            l.quarantine(Quarantine::AlreadyDone),
            PathBuf::from("/out/Skipped/AlreadyDone")
        );
        assert_eq!(
            l.quarantine(Quarantine::NotInPatientDatabase),
            PathBuf::from("/out/Skipped/NotInPatientDatabase")
        );
        assert_eq!(
            l.quarantine(Quarantine::TimedOut),
            PathBuf::from("/out/Failed/TimedOut")
        );
        assert_eq!(
            l.quarantine(Quarantine::ErroredOut),
            PathBuf::from("/out/Failed/ErroredOut")
        );
    }

    #[test]
    fn test_quarantine_file_moves_once() {
        let tmp = TempDir::new().unwrap();
        let l = layout(tmp.path());
        let src_dir = tmp.path().join("in/nested");
        std::fs::create_dir_all(&src_dir).unwrap();
        let src = src_dir.join("BED1-1000.stp");
        std::fs::write(&src, b"data").unwrap();

        let dest = l.quarantine_file(&src, Quarantine::TimedOut).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
        assert_eq!(dest, tmp.path().join("Failed/TimedOut/BED1-1000.stp"));
    }

    #[test]
    fn test_move_missing_source_errors() {
        let tmp = TempDir::new().unwrap();
        let err = move_file(&tmp.path().join("nope"), &tmp.path().join("a/b"));
        assert!(err.is_err());
    }

    #[test]
    fn test_list_files_missing_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(list_files(&tmp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_ensure_idempotent() {
        let tmp = TempDir::new().unwrap();
        let l = layout(tmp.path());
        l.ensure().unwrap();
        l.ensure().unwrap();
        assert!(l.converted().is_dir());
        assert!(l.scratch().is_dir());
        for q in Quarantine::ALL {
            assert!(l.quarantine(q).is_dir());
        }
    }
}
