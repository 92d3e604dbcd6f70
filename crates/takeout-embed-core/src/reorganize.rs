//! Second chance for the Unknown bucket: re-resolve files already sitting in
//! `<output>/Unknown` and move the ones that now have a trusted date into
//! their dated folder.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Datelike;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::date::sibling::{self, SiblingIndex};
use crate::date::ResolveOptions;
use crate::evidence::file_mtime;
use crate::exiftool::MetadataTool;
use crate::ledger::{Ledger, LedgerSaver};
use crate::media::MediaFile;
use crate::planner::{month_name, Planner, UNKNOWN_DIR};
use crate::summary::{RunSummary, SummaryAccumulator};
use crate::writer::{self, Outcome, PlannedFile, Transfer};
use crate::{
    build_pool, default_workers, extract_all, log_summary, probe_tool, resolve_all, FatalError,
    ProcessControl, ProgressCallback, SiblingMode, ThrottledProgress,
};

fn default_resolve() -> ResolveOptions {
    ResolveOptions {
        use_file_mtime: true,
        ..Default::default()
    }
}

fn default_max_distance() -> u64 {
    sibling::DEFAULT_MAX_DISTANCE
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorganizeOptions {
    /// An existing Unknown bucket; its parent is the output root.
    pub unknown_dir: PathBuf,
    /// File-mtime fallback is on by default here.
    #[serde(default = "default_resolve")]
    pub resolve: ResolveOptions,
    #[serde(default = "default_max_distance")]
    pub max_sibling_distance: u64,
    #[serde(default = "default_true")]
    pub write_metadata: bool,
    #[serde(default)]
    pub workers: Option<usize>,
}

impl ReorganizeOptions {
    pub fn new(unknown_dir: impl Into<PathBuf>) -> Self {
        Self {
            unknown_dir: unknown_dir.into(),
            resolve: default_resolve(),
            max_sibling_distance: default_max_distance(),
            write_metadata: true,
            workers: None,
        }
    }
}

/// Feed the sibling index with files already in dated folders. Their
/// modification time was set to the resolved date when they were placed;
/// files whose mtime no longer matches their folder are ignored.
fn seed_index(output_root: &Path, index: &SiblingIndex) -> usize {
    let mut seeded = 0;
    let Ok(years) = fs::read_dir(output_root) else {
        return 0;
    };
    for year_dir in years.flatten() {
        let Some(year) = year_dir
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        for entry in WalkDir::new(year_dir.path())
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .flatten()
        {
            let Some(file) = MediaFile::from_path(entry.path()) else {
                continue;
            };
            let Some(date) = file_mtime(&file.path) else {
                continue;
            };
            let month = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned());
            if date.year() == year && month.as_deref() == Some(month_name(&date).as_str()) {
                index.insert_file(&file, date);
                seeded += 1;
            }
        }
    }
    seeded
}

/// Re-resolve the files in an Unknown bucket and move the newly dated ones.
/// Files that stay rejected are left where they are.
pub fn reorganize(
    options: &ReorganizeOptions,
    tool: &dyn MetadataTool,
    control: &ProcessControl,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<RunSummary> {
    let tp = ThrottledProgress::new(progress_callback);
    let unknown_dir = fs::canonicalize(&options.unknown_dir)
        .ok()
        .filter(|p| p.is_dir())
        .ok_or_else(|| FatalError::InputMissing(options.unknown_dir.clone()))?;
    let output_root = unknown_dir
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| FatalError::InputMissing(options.unknown_dir.clone()))?;
    if unknown_dir.file_name().is_some_and(|n| n != UNKNOWN_DIR) {
        tracing::warn!(
            "{} is not named {}, treating its parent as the output root anyway",
            unknown_dir.display(),
            UNKNOWN_DIR
        );
    }
    let tool_usable = probe_tool(tool, options.write_metadata)?;

    let files = crate::scan::scan_media(&unknown_dir, None, &tp);
    let total = files.len() as u64;
    let acc = SummaryAccumulator::new();
    if files.is_empty() {
        return Ok(acc.finish(0, false));
    }

    let workers = options.workers.unwrap_or_else(default_workers);
    let pool = build_pool(workers)?;
    let now = control.now();

    let reader = tool_usable.then_some(tool);
    let Some(evidence) = extract_all(&files, reader, &pool, control, &tp) else {
        return Ok(acc.finish(total, true));
    };

    let index = SiblingIndex::new();
    if options.resolve.guess_from_siblings {
        let seeded = seed_index(&output_root, &index);
        tracing::info!("seeded sibling index with {} dated file(s)", seeded);
    }
    let verdicts = resolve_all(
        &files,
        &evidence,
        &options.resolve,
        options.max_sibling_distance,
        SiblingMode::TwoPass,
        now,
        &index,
        &pool,
    );

    if control.is_cancelled() {
        return Ok(acc.finish(total, true));
    }

    let ledger = Ledger::load(&output_root);
    let planned = {
        let mut planner = Planner::new(&output_root, &ledger);
        let mut planned = Vec::new();
        for ((file, evidence), verdict) in files.into_iter().zip(evidence).zip(verdicts) {
            if !verdict.accepted {
                tracing::info!(
                    file = %file.path.display(),
                    reason = %verdict.reject_reason.map(|r| r.to_string()).unwrap_or_default(),
                    "stays in {}",
                    UNKNOWN_DIR
                );
                acc.unresolved();
                continue;
            }
            match planner.place(&file, &verdict) {
                Ok(placement) => planned.push(PlannedFile {
                    file,
                    evidence,
                    verdict,
                    placement,
                }),
                Err(e) => {
                    tracing::error!(file = %file.path.display(), "{}", e);
                    acc.fail(&file.path, e.to_string());
                }
            }
        }
        planned
    };

    let saver = Mutex::new(LedgerSaver::new(ledger, output_root.clone()));
    let writer_tool = (options.write_metadata && tool_usable).then_some(tool);
    let cancelled = AtomicBool::new(false);
    let counter = AtomicU64::new(0);
    let move_total = planned.len() as u64;

    pool.install(|| {
        planned.par_iter().for_each(|p| {
            if control.is_cancelled() {
                cancelled.store(true, Ordering::SeqCst);
                return;
            }
            match writer::execute(p, Transfer::Move, writer_tool, &saver) {
                // nothing was moved; the duplicate stays behind
                Outcome::AlreadyPresent => {
                    tracing::info!(
                        file = %p.file.path.display(),
                        "same content already at {}, stays in {}",
                        p.placement.destination.display(),
                        UNKNOWN_DIR
                    );
                    acc.unresolved();
                }
                outcome => acc.record(&p.file.path, &outcome),
            }
            let current = counter.fetch_add(1, Ordering::Relaxed);
            tp.report("reorganize", current, move_total, "Moving files");
        })
    });

    saver.into_inner().unwrap_or_else(|e| e.into_inner()).force_save();

    let summary = acc.finish(total, cancelled.into_inner());
    log_summary(&summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_seed_index_uses_matching_mtimes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let march = root.join("2020").join("March");
        fs::create_dir_all(&march).unwrap();

        let good = march.join("IMG_0100.JPG");
        let stale = march.join("IMG_0300.JPG");
        fs::write(&good, b"a").unwrap();
        fs::write(&stale, b"b").unwrap();
        let date = NaiveDate::from_ymd_opt(2020, 3, 10).unwrap().and_hms_opt(8, 0, 0).unwrap();
        writer::set_file_times(&good, date);

        let index = SiblingIndex::new();
        assert_eq!(seed_index(root, &index), 1);
        let m = index.nearest("img_#", 120, 100).unwrap();
        assert_eq!(m.number, 100);
        assert_eq!(m.date, date);
    }
}
