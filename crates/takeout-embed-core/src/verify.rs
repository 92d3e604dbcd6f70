//! Post-run check of an output tree.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::date::exif;
use crate::exiftool::MetadataTool;
use crate::media::{MediaFile, MediaKind};
use crate::planner::{month_name, UNKNOWN_DIR};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub total: u64,
    pub readable: u64,
    pub unreadable: Vec<PathBuf>,
    /// Images carrying an embedded original timestamp
    pub with_date: u64,
    /// Images without one
    pub without_date: Vec<PathBuf>,
    /// Files whose `<YYYY>/<Month>` folder disagrees with their embedded date
    pub misplaced: Vec<PathBuf>,
}

fn readable(path: &Path) -> bool {
    let mut buf = [0u8; 1024];
    File::open(path).and_then(|mut f| f.read(&mut buf)).is_ok()
}

/// `(year, month name)` of the dated folder holding `path`, relative to the
/// output root; None for Unknown and anything else.
fn dated_folder(root: &Path, path: &Path) -> Option<(i32, String)> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    match parts.as_slice() {
        [year, month, _] if year != UNKNOWN_DIR => Some((year.parse().ok()?, month.to_string())),
        _ => None,
    }
}

/// Walk `output_root` and check every media file. With a tool, embedded
/// dates the in-process reader cannot see are also checked.
pub fn verify(output_root: &Path, tool: Option<&dyn MetadataTool>) -> anyhow::Result<VerifyReport> {
    anyhow::ensure!(output_root.is_dir(), "{} is not a directory", output_root.display());
    let mut report = VerifyReport::default();

    for entry in WalkDir::new(output_root).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file) = MediaFile::from_path(entry.path()) else {
            continue;
        };
        report.total += 1;

        if !readable(&file.path) {
            tracing::warn!(file = %file.path.display(), "unreadable");
            report.unreadable.push(file.path);
            continue;
        }
        report.readable += 1;

        let mut original = match file.kind {
            MediaKind::Image => exif::read_embedded_dates(&file.path).and_then(|d| d.original),
            MediaKind::Video => None,
        };
        if original.is_none() {
            if let Some(tool) = tool {
                original = tool.read_dates(&file.path).ok().and_then(|d| d.original.or(d.create));
            }
        }

        match original {
            Some(date) => {
                if file.kind == MediaKind::Image {
                    report.with_date += 1;
                }
                if let Some((year, month)) = dated_folder(output_root, &file.path) {
                    if year != date.year() || month != month_name(&date) {
                        tracing::warn!(file = %file.path.display(), "embedded date {} disagrees with folder", date);
                        report.misplaced.push(file.path);
                    }
                }
            }
            None if file.kind == MediaKind::Image => report.without_date.push(file.path),
            None => {}
        }
    }

    tracing::info!(
        total = report.total,
        unreadable = report.unreadable.len(),
        with_date = report.with_date,
        without_date = report.without_date.len(),
        misplaced = report.misplaced.len(),
        "verify finished"
    );
    Ok(report)
}
