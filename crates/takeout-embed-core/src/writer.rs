//! Executes placement decisions: brings the bytes to their destination,
//! embeds metadata into the destination copy and sets its file times.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::NaiveDateTime;
use filetime::FileTime;

use crate::date::DateVerdict;
use crate::evidence::MetadataEvidence;
use crate::exiftool::MetadataTool;
use crate::ledger::{LedgerSaver, SourceIdentity};
use crate::media::MediaFile;
use crate::planner::{Bucket, PlacementDecision};

/// How a file reaches its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Copy; the source is never touched.
    Copy,
    /// Rename, used when reorganizing files already in the output tree.
    Move,
}

/// Everything needed to finish one file.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub file: MediaFile,
    pub evidence: MetadataEvidence,
    pub verdict: DateVerdict,
    pub placement: PlacementDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Placed(Bucket),
    AlreadyPresent,
    Failed(String),
}

fn part_path(dest: &Path) -> PathBuf {
    let name = dest.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    dest.with_file_name(format!(".{}.part", name))
}

/// `(atime, mtime)` of `path`.
fn file_times(path: &Path) -> Option<(FileTime, FileTime)> {
    let meta = fs::metadata(path).ok()?;
    Some((
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    ))
}

/// Copy `src` to `dest` through a hidden `.part` file, so an interrupted copy
/// never sits under the final name. The copy keeps the source's file times.
pub fn copy_into_place(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let part = part_path(dest);
    let result = (|| -> anyhow::Result<()> {
        let mut reader = File::open(src).with_context(|| format!("opening {}", src.display()))?;
        let meta = reader.metadata()?;
        let mut writer = BufWriter::new(
            File::create(&part).with_context(|| format!("creating {}", part.display()))?,
        );
        io::copy(&mut reader, &mut writer).with_context(|| format!("copying to {}", part.display()))?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;
        filetime::set_file_times(
            &part,
            FileTime::from_last_access_time(&meta),
            FileTime::from_last_modification_time(&meta),
        )
        .with_context(|| format!("setting file times on {}", part.display()))?;
        fs::rename(&part, dest).with_context(|| format!("renaming to {}", dest.display()))?;
        Ok(())
    })();
    if result.is_err() {
        fs::remove_file(&part).ok();
    }
    result
}

/// Move `src` to `dest`. Falls back to copy + remove when a rename is not
/// possible (different filesystems).
pub fn move_into_place(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    copy_into_place(src, dest)?;
    fs::remove_file(src).with_context(|| format!("removing {}", src.display()))?;
    Ok(())
}

/// Set the destination's modification and access times to `date`
/// (interpreted as local time). Best-effort.
pub fn set_file_times(dest: &Path, date: NaiveDateTime) {
    let Some(local) = date.and_local_timezone(chrono::Local).earliest() else {
        tracing::warn!(file = %dest.display(), "no local time for {}", date);
        return;
    };
    let ft = FileTime::from_unix_time(local.timestamp(), 0);
    if let Err(e) = filetime::set_file_times(dest, ft, ft) {
        tracing::warn!(file = %dest.display(), "could not set file times: {}", e);
    }
}

/// Take back a transfer whose metadata write failed, so nothing marks the
/// file as done and a later run retries it.
fn undo_transfer(src: &Path, dest: &Path, transfer: Transfer) {
    let undone = match transfer {
        Transfer::Copy => fs::remove_file(dest),
        Transfer::Move => fs::rename(dest, src),
    };
    if let Err(e) = undone {
        tracing::warn!(file = %dest.display(), "could not undo placement: {}", e);
    }
}

/// Finish one planned file. Failures are returned as an outcome, never
/// propagated, so one file cannot abort the batch.
pub fn execute(
    planned: &PlannedFile,
    transfer: Transfer,
    tool: Option<&dyn MetadataTool>,
    ledger: &Mutex<LedgerSaver>,
) -> Outcome {
    let src = &planned.file.path;
    let dest = &planned.placement.destination;

    if planned.placement.already_present {
        tracing::info!(file = %src.display(), "already processed at {}, skipping", dest.display());
        return Outcome::AlreadyPresent;
    }

    // Identity and times are taken before a move, while the source still exists.
    let identity = SourceIdentity::of(src).ok();
    let source_times = file_times(src);

    let transferred = match transfer {
        Transfer::Copy => copy_into_place(src, dest),
        Transfer::Move => move_into_place(src, dest),
    };
    if let Err(e) = transferred {
        tracing::error!(file = %src.display(), "could not place file: {:#}", e);
        return Outcome::Failed(format!("{:#}", e));
    }

    if let Some(tool) = tool {
        let fields = planned.evidence.fields_to_write(&planned.verdict, planned.file.kind);
        if !fields.is_empty() {
            if let Err(e) = tool.write(dest, planned.file.kind, &fields) {
                tracing::error!(
                    file = %src.display(),
                    "metadata write failed for {}: {}",
                    dest.display(),
                    e
                );
                undo_transfer(src, dest, transfer);
                return Outcome::Failed(format!("metadata write failed: {}", e));
            }
        }
    }

    match (planned.verdict.date(), source_times) {
        (Some(date), _) => set_file_times(dest, date),
        // the tool rewrote the file; keep the source's times for a later reorganize
        (None, Some((atime, mtime))) => {
            if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
                tracing::warn!(file = %dest.display(), "could not restore file times: {}", e);
            }
        }
        (None, None) => {}
    }

    {
        let mut saver = ledger.lock().unwrap();
        match transfer {
            Transfer::Copy => {
                if let Some(identity) = identity {
                    saver.record(identity, dest);
                }
            }
            Transfer::Move => saver.relocate(src, dest),
        }
    }

    match &planned.verdict {
        v if v.accepted => tracing::info!(
            file = %src.display(),
            source = v.source.map(|s| s.label()).unwrap_or("none"),
            "placed at {}",
            dest.display()
        ),
        v => tracing::info!(
            file = %src.display(),
            reason = %v.reject_reason.map(|r| r.to_string()).unwrap_or_default(),
            "no trusted date, placed at {}",
            dest.display()
        ),
    }
    Outcome::Placed(planned.placement.bucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::{DateSource, DateVerdict};
    use crate::exiftool::{MetadataFields, ToolError};
    use crate::ledger::Ledger;
    use crate::date::exif::EmbeddedDates;
    use crate::media::MediaKind;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    struct FailingTool;

    impl MetadataTool for FailingTool {
        fn version(&self) -> Result<String, ToolError> {
            Ok("0".into())
        }
        fn read_dates(&self, _: &Path) -> Result<EmbeddedDates, ToolError> {
            Ok(EmbeddedDates::default())
        }
        fn write(&self, _: &Path, _: MediaKind, _: &MetadataFields) -> Result<(), ToolError> {
            Err(ToolError::Timeout(std::time::Duration::from_secs(30)))
        }
    }

    fn planned(src: &Path, dest: &Path) -> PlannedFile {
        let date = NaiveDate::from_ymd_opt(2022, 12, 21).unwrap().and_hms_opt(12, 0, 0).unwrap();
        PlannedFile {
            file: MediaFile::from_path(src).unwrap(),
            evidence: MetadataEvidence::default(),
            verdict: DateVerdict::accepted(date, DateSource::SidecarJson),
            placement: PlacementDecision {
                destination: dest.to_path_buf(),
                bucket: Bucket::Dated,
                collision_suffix: None,
                already_present: false,
            },
        }
    }

    #[test]
    fn test_copy_leaves_no_part_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("A.JPG");
        fs::write(&src, b"bytes").unwrap();
        let dest = dir.path().join("out/2022/December/A.JPG");

        let old = FileTime::from_unix_time(1_400_000_000, 0);
        filetime::set_file_times(&src, old, old).unwrap();

        copy_into_place(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"bytes");
        let meta = fs::metadata(&dest).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta), old);
        assert_eq!(fs::read(&src).unwrap(), b"bytes");
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_move_removes_source() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("Unknown/B.PNG");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"png").unwrap();
        let dest = dir.path().join("2020/March/B.PNG");

        move_into_place(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"png");
    }

    #[test]
    fn test_execute_sets_mtime_and_records() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let src = dir.path().join("A.JPG");
        fs::write(&src, b"bytes").unwrap();
        let dest = root.join("2022/December/A.JPG");
        let p = planned(&src, &dest);
        let ledger = Mutex::new(LedgerSaver::new(Ledger::new(), root.clone()));

        let outcome = execute(&p, Transfer::Copy, None, &ledger);
        assert_eq!(outcome, Outcome::Placed(Bucket::Dated));

        let mtime = crate::evidence::file_mtime(&dest).unwrap();
        assert_eq!(mtime, p.verdict.timestamp.unwrap());
        let saver = ledger.lock().unwrap();
        let id = SourceIdentity::of(&src).unwrap();
        assert_eq!(saver.ledger().destination_of(&id, &root), Some(dest));
    }

    #[test]
    fn test_tool_failure_is_per_file_failure() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let src = dir.path().join("A.JPG");
        fs::write(&src, b"bytes").unwrap();
        let dest = root.join("2022/December/A.JPG");
        let p = planned(&src, &dest);
        let ledger = Mutex::new(LedgerSaver::new(Ledger::new(), root));

        match execute(&p, Transfer::Copy, Some(&FailingTool), &ledger) {
            Outcome::Failed(reason) => assert!(reason.contains("timed out") || reason.contains("metadata")),
            other => panic!("expected failure, got {:?}", other),
        }
        // no copy without metadata is left behind to pass for a finished one
        assert!(!dest.exists());
        assert!(fs::read_dir(dest.parent().unwrap()).unwrap().next().is_none());
        assert!(src.exists());
        assert!(ledger.lock().unwrap().ledger().is_empty());
    }

    #[test]
    fn test_tool_failure_on_move_returns_file() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let src = root.join("Unknown/A.JPG");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"bytes").unwrap();
        let dest = root.join("2022/December/A.JPG");
        let p = planned(&src, &dest);
        let ledger = Mutex::new(LedgerSaver::new(Ledger::new(), root));

        assert!(matches!(
            execute(&p, Transfer::Move, Some(&FailingTool), &ledger),
            Outcome::Failed(_)
        ));
        assert!(!dest.exists());
        assert_eq!(fs::read(&src).unwrap(), b"bytes");
    }

    #[test]
    fn test_unknown_copy_keeps_source_mtime() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let src = dir.path().join("B.PNG");
        fs::write(&src, b"png").unwrap();
        let old = FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_times(&src, old, old).unwrap();

        let dest = root.join("Unknown/B.PNG");
        let mut p = planned(&src, &dest);
        p.verdict = DateVerdict::no_evidence();
        p.placement.bucket = Bucket::Unknown;
        let ledger = Mutex::new(LedgerSaver::new(Ledger::new(), root));

        assert_eq!(execute(&p, Transfer::Copy, None, &ledger), Outcome::Placed(Bucket::Unknown));
        let meta = fs::metadata(&dest).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta), old);
    }

    #[test]
    fn test_already_present_is_not_touched() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let src = dir.path().join("A.JPG");
        fs::write(&src, b"bytes").unwrap();
        let dest = root.join("2022/December/A.JPG");
        let mut p = planned(&src, &dest);
        p.placement.already_present = true;
        let ledger = Mutex::new(LedgerSaver::new(Ledger::new(), root));

        assert_eq!(execute(&p, Transfer::Copy, None, &ledger), Outcome::AlreadyPresent);
        assert!(!dest.exists());
    }
}
