//! Destination paths: `<root>/<YYYY>/<Month>/<name>` for dated files,
//! `<root>/Unknown/<name>` otherwise, with `_1`, `_2`, ... suffixes on
//! collisions.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::date::DateVerdict;
use crate::ledger::{Ledger, SourceIdentity};
use crate::media::MediaFile;

pub const UNKNOWN_DIR: &str = "Unknown";

/// Give up on a name after this many suffixes.
const MAX_COLLISION_SUFFIX: u32 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Dated,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    pub destination: PathBuf,
    pub bucket: Bucket,
    pub collision_suffix: Option<u32>,
    /// The destination already holds this source from an earlier run.
    pub already_present: bool,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no free file name for {} after {} attempts", .0.display(), MAX_COLLISION_SUFFIX)]
    Exhausted(PathBuf),
}

/// Full English month name (`December`).
pub fn month_name(dt: &NaiveDateTime) -> String {
    dt.format("%B").to_string()
}

/// Folder a verdict maps to, before any collision handling.
pub fn target_dir(output_root: &Path, verdict: &DateVerdict) -> (PathBuf, Bucket) {
    match verdict.date() {
        Some(dt) => (
            output_root.join(dt.year().to_string()).join(month_name(&dt)),
            Bucket::Dated,
        ),
        None => (output_root.join(UNKNOWN_DIR), Bucket::Unknown),
    }
}

/// `IMG.JPG` + 2 -> `IMG_2.JPG`
fn suffixed_name(filename: &str, n: u32) -> String {
    let path = Path::new(filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
    match path.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, n, ext),
        None => format!("{}_{}", stem, n),
    }
}

/// Recursively scan directory for existing files with sizes (for fast exists/size checks).
fn scan_existing_files(dir: &Path) -> HashMap<PathBuf, u64> {
    let mut files = HashMap::new();
    scan_existing_files_recursive(dir, &mut files);
    files
}

fn scan_existing_files_recursive(dir: &Path, files: &mut HashMap<PathBuf, u64>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_existing_files_recursive(&path, files);
        } else if let Ok(meta) = entry.metadata() {
            files.insert(path, meta.len());
        }
    }
}

fn sha256_file(path: &Path) -> io::Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::new(File::open(path)?), &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

/// Byte-for-byte identity via SHA-256; any I/O error counts as different.
pub fn same_content(a: &Path, b: &Path) -> bool {
    match (sha256_file(a), sha256_file(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

/// Assigns destinations for one run.
///
/// Destinations handed out in this run are remembered, so two sources with
/// the same name never get the same path even before either is written.
pub struct Planner<'a> {
    output_root: PathBuf,
    ledger: &'a Ledger,
    existing: HashMap<PathBuf, u64>,
    used: HashSet<PathBuf>,
}

impl<'a> Planner<'a> {
    pub fn new(output_root: &Path, ledger: &'a Ledger) -> Self {
        let existing = if output_root.exists() {
            scan_existing_files(output_root)
        } else {
            HashMap::new()
        };
        Self {
            output_root: output_root.to_path_buf(),
            ledger,
            existing,
            used: HashSet::new(),
        }
    }

    /// Does the existing file at `candidate` hold exactly `file`'s bytes?
    fn is_same_source(&self, file: &MediaFile, identity: Option<&SourceIdentity>, candidate: &Path) -> bool {
        let existing_size = self.existing.get(candidate).copied();
        let source_size = identity.map(|id| id.size);
        existing_size.is_some() && existing_size == source_size && same_content(&file.path, candidate)
    }

    /// Compute where `file` goes for `verdict`.
    ///
    /// A source the ledger already placed is skipped wherever its copy lives
    /// now, even after a reorganize moved it out of Unknown.
    pub fn place(&mut self, file: &MediaFile, verdict: &DateVerdict) -> Result<PlacementDecision, PlanError> {
        let identity = SourceIdentity::of(&file.path).ok();
        if let Some(recorded) = identity
            .as_ref()
            .and_then(|id| self.ledger.destination_of(id, &self.output_root))
            .filter(|dest| self.existing.contains_key(dest))
        {
            let bucket = if recorded.starts_with(self.output_root.join(UNKNOWN_DIR)) {
                Bucket::Unknown
            } else {
                Bucket::Dated
            };
            self.used.insert(recorded.clone());
            return Ok(PlacementDecision {
                destination: recorded,
                bucket,
                collision_suffix: None,
                already_present: true,
            });
        }

        let (dir, bucket) = target_dir(&self.output_root, verdict);

        for n in 0..=MAX_COLLISION_SUFFIX {
            let (candidate, suffix) = if n == 0 {
                (dir.join(&file.filename), None)
            } else {
                (dir.join(suffixed_name(&file.filename, n)), Some(n))
            };

            if self.used.contains(&candidate) {
                continue;
            }

            if self.existing.contains_key(&candidate) {
                if self.is_same_source(file, identity.as_ref(), &candidate) {
                    self.used.insert(candidate.clone());
                    return Ok(PlacementDecision {
                        destination: candidate,
                        bucket,
                        collision_suffix: suffix,
                        already_present: true,
                    });
                }
                continue;
            }

            if suffix.is_some() {
                tracing::info!(
                    file = %file.filename,
                    "name collision, using {}",
                    candidate.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
                );
            }
            self.used.insert(candidate.clone());
            return Ok(PlacementDecision {
                destination: candidate,
                bucket,
                collision_suffix: suffix,
                already_present: false,
            });
        }

        Err(PlanError::Exhausted(dir.join(&file.filename)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::{DateSource, DateVerdict};
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn verdict(y: i32, m: u32, d: u32) -> DateVerdict {
        let dt = NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(9, 0, 0).unwrap();
        DateVerdict::accepted(dt, DateSource::SidecarJson)
    }

    fn source(dir: &Path, rel: &str, body: &[u8]) -> MediaFile {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        MediaFile::from_path(&path).unwrap()
    }

    #[test]
    fn test_dated_and_unknown_targets() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let ledger = Ledger::new();
        let mut planner = Planner::new(&root, &ledger);

        let a = source(dir.path(), "in/A.JPG", b"a");
        let p = planner.place(&a, &verdict(2022, 12, 21)).unwrap();
        assert_eq!(p.destination, root.join("2022").join("December").join("A.JPG"));
        assert_eq!(p.bucket, Bucket::Dated);
        assert_eq!(p.collision_suffix, None);
        assert!(!p.already_present);

        let b = source(dir.path(), "in/B.PNG", b"b");
        let p = planner.place(&b, &DateVerdict::no_evidence()).unwrap();
        assert_eq!(p.destination, root.join("Unknown").join("B.PNG"));
        assert_eq!(p.bucket, Bucket::Unknown);
    }

    #[test]
    fn test_collision_within_run() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let ledger = Ledger::new();
        let mut planner = Planner::new(&root, &ledger);

        let first = source(dir.path(), "a/IMG.JPG", b"one");
        let second = source(dir.path(), "b/IMG.JPG", b"two");
        let v = verdict(2021, 3, 1);
        let p1 = planner.place(&first, &v).unwrap();
        let p2 = planner.place(&second, &v).unwrap();
        assert_eq!(p1.destination.file_name().unwrap(), "IMG.JPG");
        assert_eq!(p2.destination.file_name().unwrap(), "IMG_1.JPG");
        assert_eq!(p2.collision_suffix, Some(1));
    }

    #[test]
    fn test_existing_other_file_gets_suffix_same_file_is_skipped() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let unknown = root.join("Unknown");
        fs::create_dir_all(&unknown).unwrap();
        fs::write(unknown.join("IMG.JPG"), b"someone else").unwrap();
        fs::write(unknown.join("IMG_1.JPG"), b"mine").unwrap();

        let ledger = Ledger::new();
        let mut planner = Planner::new(&root, &ledger);
        let mine = source(dir.path(), "in/IMG.JPG", b"mine");
        let p = planner.place(&mine, &DateVerdict::no_evidence()).unwrap();
        assert_eq!(p.destination, unknown.join("IMG_1.JPG"));
        assert!(p.already_present);

        let other = source(dir.path(), "in2/IMG.JPG", b"third");
        let p = planner.place(&other, &DateVerdict::no_evidence()).unwrap();
        assert_eq!(p.destination, unknown.join("IMG_2.JPG"));
        assert!(!p.already_present);
    }

    #[test]
    fn test_ledger_recognises_rewritten_copy() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let dest = root.join("2022").join("December").join("A.JPG");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        // bytes differ from the source: metadata was written into the copy
        fs::write(&dest, b"a + exif").unwrap();

        let a = source(dir.path(), "in/A.JPG", b"a");
        let mut ledger = Ledger::new();
        ledger.record(SourceIdentity::of(&a.path).unwrap(), &dest, &root);

        let mut planner = Planner::new(&root, &ledger);
        let p = planner.place(&a, &verdict(2022, 12, 21)).unwrap();
        assert_eq!(p.destination, dest);
        assert!(p.already_present);
    }

    #[test]
    fn test_ledger_follows_relocated_copy() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let moved = root.join("2020").join("March").join("B.PNG");
        fs::create_dir_all(moved.parent().unwrap()).unwrap();
        fs::write(&moved, b"b").unwrap();

        let b = source(dir.path(), "in/B.PNG", b"b");
        let mut ledger = Ledger::new();
        ledger.record(SourceIdentity::of(&b.path).unwrap(), &root.join("Unknown/B.PNG"), &root);
        ledger.relocate(&root.join("Unknown/B.PNG"), &moved, &root);

        let mut planner = Planner::new(&root, &ledger);
        let p = planner.place(&b, &DateVerdict::no_evidence()).unwrap();
        assert_eq!(p.destination, moved);
        assert_eq!(p.bucket, Bucket::Dated);
        assert!(p.already_present);
        assert!(!root.join("Unknown").join("B.PNG").exists());
    }

    #[test]
    fn test_ledger_entry_without_file_is_placed_again() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        let a = source(dir.path(), "in/A.JPG", b"a");
        let mut ledger = Ledger::new();
        ledger.record(SourceIdentity::of(&a.path).unwrap(), &root.join("2019/May/A.JPG"), &root);

        let mut planner = Planner::new(&root, &ledger);
        let p = planner.place(&a, &verdict(2022, 12, 21)).unwrap();
        assert_eq!(p.destination, root.join("2022").join("December").join("A.JPG"));
        assert!(!p.already_present);
    }

    #[test]
    fn test_suffixed_name() {
        assert_eq!(suffixed_name("IMG.JPG", 2), "IMG_2.JPG");
        assert_eq!(suffixed_name("archive.tar.gz", 1), "archive.tar_1.gz");
        assert_eq!(suffixed_name("README", 3), "README_3");
    }

    #[test]
    fn test_month_names() {
        let dt = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(month_name(&dt), "March");
    }
}
