pub mod control;
pub mod date;
pub mod evidence;
pub mod exiftool;
pub mod extras;
pub mod ledger;
pub mod media;
pub mod planner;
pub mod reorganize;
pub mod scan;
pub mod sidecar;
pub mod summary;
pub mod verify;
pub mod writer;


use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use date::sibling::{self, SiblingIndex};
use date::{DateVerdict, ResolveOptions};
use evidence::MetadataEvidence;
use exiftool::{MetadataTool, ToolError};
use ledger::{Ledger, LedgerSaver};
use media::MediaFile;
use planner::Planner;
use writer::{Outcome, PlannedFile, Transfer};

pub use control::{CancellationToken, CancelledError, ProcessControl};
pub use summary::{FileFailure, RunSummary};

/// Default output directory name, created inside the input root.
pub const DEFAULT_OUTPUT_DIR: &str = "Output";

fn default_max_distance() -> u64 {
    sibling::DEFAULT_MAX_DISTANCE
}

fn default_true() -> bool {
    true
}

/// How sibling inference sees the rest of the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SiblingMode {
    /// Resolve direct evidence for every file first, then infer the rest.
    /// Independent of processing order.
    #[default]
    TwoPass,
    /// Resolve files one by one in path order; every accepted date,
    /// inferred ones included, is visible to the files after it.
    SinglePass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub input: PathBuf,
    /// Defaults to `<input>/Output`.
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(flatten)]
    pub resolve: ResolveOptions,
    #[serde(default = "default_max_distance")]
    pub max_sibling_distance: u64,
    #[serde(default)]
    pub sibling_mode: SiblingMode,
    #[serde(default = "default_true")]
    pub write_metadata: bool,
    /// Worker threads; see [`default_workers`].
    #[serde(default)]
    pub workers: Option<usize>,
}

impl RunOptions {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: None,
            resolve: ResolveOptions::default(),
            max_sibling_distance: default_max_distance(),
            sibling_mode: SiblingMode::default(),
            write_metadata: true,
            workers: None,
        }
    }

    pub fn output_root(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.input.join(DEFAULT_OUTPUT_DIR))
    }
}

/// One fewer than the available cores, kept between 4 and 8.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    cpus.saturating_sub(1).clamp(4, 8)
}

/// Conditions that stop a run before any file is touched.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("input directory {} does not exist", .0.display())]
    InputMissing(PathBuf),

    #[error("cannot create output directory {}: {}", .path.display(), .source)]
    OutputNotCreatable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata tool unavailable: {0}")]
    ToolUnavailable(#[from] ToolError),
}

/// Type alias for progress callback
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

/// Throttled progress reporter, emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback,
    last_emit: Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback) -> Self {
        Self {
            inner,
            last_emit: Mutex::new(Instant::now() - std::time::Duration::from_secs(1)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap();
            if last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Probe the tool. Required when metadata is written; otherwise a missing
/// tool only means embedded dates of videos cannot be read.
pub(crate) fn probe_tool(tool: &dyn MetadataTool, required: bool) -> Result<bool, FatalError> {
    match tool.version() {
        Ok(v) => {
            tracing::info!("using exiftool {}", v.trim());
            Ok(true)
        }
        Err(e) if required => Err(FatalError::ToolUnavailable(e)),
        Err(e) => {
            tracing::warn!("exiftool unavailable, embedded dates of videos will not be read: {}", e);
            Ok(false)
        }
    }
}

pub(crate) fn create_output_root(path: &Path) -> Result<PathBuf, FatalError> {
    let not_creatable = |source| FatalError::OutputNotCreatable {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(path).map_err(not_creatable)?;
    fs::canonicalize(path).map_err(not_creatable)
}

pub(crate) fn build_pool(workers: usize) -> anyhow::Result<rayon::ThreadPool> {
    Ok(rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("takeout-embed-{}", i))
        .build()?)
}

/// Read evidence for every file on the pool. None when cancelled first.
pub(crate) fn extract_all(
    files: &[MediaFile],
    reader: Option<&dyn MetadataTool>,
    pool: &rayon::ThreadPool,
    control: &ProcessControl,
    tp: &ThrottledProgress,
) -> Option<Vec<MetadataEvidence>> {
    let total = files.len() as u64;
    let counter = AtomicU64::new(0);
    let evidence: Vec<Option<MetadataEvidence>> = pool.install(|| {
        files
            .par_iter()
            .map(|f| {
                if control.is_cancelled() {
                    return None;
                }
                let e = evidence::extract(f, reader);
                let current = counter.fetch_add(1, Ordering::Relaxed);
                tp.report("evidence", current, total, "Reading metadata");
                Some(e)
            })
            .collect()
    });
    evidence.into_iter().collect()
}

/// Resolve a verdict for every file, consulting `index` for inference.
pub(crate) fn resolve_all(
    files: &[MediaFile],
    evidence: &[MetadataEvidence],
    options: &ResolveOptions,
    max_distance: u64,
    mode: SiblingMode,
    now: NaiveDateTime,
    index: &SiblingIndex,
    pool: &rayon::ThreadPool,
) -> Vec<DateVerdict> {
    let infer = |f: &MediaFile| sibling::infer(f, index, max_distance).map(|m| m.date);

    match mode {
        SiblingMode::SinglePass => files
            .iter()
            .zip(evidence)
            .map(|(f, e)| {
                let v = date::resolve(e, options, now, || infer(f));
                if let Some(d) = v.date() {
                    index.insert_file(f, d);
                }
                v
            })
            .collect(),
        SiblingMode::TwoPass => pool.install(|| {
            let mut verdicts: Vec<DateVerdict> = files
                .par_iter()
                .zip(evidence.par_iter())
                .map(|(f, e)| {
                    let v = date::resolve(e, options, now, || None);
                    if let Some(d) = v.date() {
                        index.insert_file(f, d);
                    }
                    v
                })
                .collect();
            if options.guess_from_siblings {
                verdicts
                    .par_iter_mut()
                    .zip(files.par_iter().zip(evidence.par_iter()))
                    .filter(|(v, _)| v.awaits_inference())
                    .for_each(|(v, (f, e))| *v = date::resolve(e, options, now, || infer(f)));
            }
            verdicts
        }),
    }
}

/// Run a full pass over `options.input`: enumerate, resolve, place, copy and
/// embed.
pub fn run(
    options: &RunOptions,
    tool: &dyn MetadataTool,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<RunSummary> {
    run_with_control(options, tool, &ProcessControl::default(), progress_callback)
}

/// [`run`] with cancellation and a reference time.
pub fn run_with_control(
    options: &RunOptions,
    tool: &dyn MetadataTool,
    control: &ProcessControl,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<RunSummary> {
    let tp = ThrottledProgress::new(progress_callback);
    let input = fs::canonicalize(&options.input)
        .ok()
        .filter(|p| p.is_dir())
        .ok_or_else(|| FatalError::InputMissing(options.input.clone()))?;
    let tool_usable = probe_tool(tool, options.write_metadata)?;
    let output_root = create_output_root(&options.output_root())?;

    let files = scan::scan_media(&input, Some(&output_root), &tp);
    process(files, &output_root, options, tool, tool_usable, control, &tp)
}

/// Process an already enumerated file set. Files are handled in path order.
pub fn run_files(
    files: Vec<MediaFile>,
    options: &RunOptions,
    tool: &dyn MetadataTool,
    control: &ProcessControl,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<RunSummary> {
    let tp = ThrottledProgress::new(progress_callback);
    let tool_usable = probe_tool(tool, options.write_metadata)?;
    let output_root = create_output_root(&options.output_root())?;

    let mut files: Vec<MediaFile> = files
        .into_iter()
        .filter(|f| {
            let inside = fs::canonicalize(&f.path)
                .map(|p| p.starts_with(&output_root))
                .unwrap_or_else(|_| f.path.starts_with(&output_root));
            if inside {
                tracing::debug!(file = %f.path.display(), "skipping file under the output root");
            }
            !inside
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    process(files, &output_root, options, tool, tool_usable, control, &tp)
}

fn process(
    files: Vec<MediaFile>,
    output_root: &Path,
    options: &RunOptions,
    tool: &dyn MetadataTool,
    tool_usable: bool,
    control: &ProcessControl,
    tp: &ThrottledProgress,
) -> anyhow::Result<RunSummary> {
    let total = files.len() as u64;
    let acc = summary::SummaryAccumulator::new();
    let now = control.now();
    let workers = options.workers.unwrap_or_else(default_workers);
    let pool = build_pool(workers)?;
    tracing::info!(
        "processing {} file(s) into {} with {} worker(s)",
        total,
        output_root.display(),
        workers
    );

    if files.is_empty() {
        return Ok(acc.finish(0, false));
    }

    // Stage 1: evidence
    let reader = tool_usable.then_some(tool);
    let Some(evidence) = extract_all(&files, reader, &pool, control, tp) else {
        tracing::warn!("cancelled while reading metadata");
        return Ok(acc.finish(total, true));
    };

    // Stage 2: dates
    let index = SiblingIndex::new();
    let verdicts = resolve_all(
        &files,
        &evidence,
        &options.resolve,
        options.max_sibling_distance,
        options.sibling_mode,
        now,
        &index,
        &pool,
    );
    let accepted = verdicts.iter().filter(|v| v.accepted).count();
    tp.report("date", total, total, "Dates resolved");
    tracing::info!("{} of {} file(s) have a trusted date", accepted, total);

    if control.is_cancelled() {
        return Ok(acc.finish(total, true));
    }

    // Stage 3: destinations, sequentially so suffixes are deterministic
    let ledger = Ledger::load(output_root);
    let planned = {
        let mut planner = Planner::new(output_root, &ledger);
        let mut planned = Vec::with_capacity(files.len());
        for ((file, evidence), verdict) in files.into_iter().zip(evidence).zip(verdicts) {
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

    // Stage 4: copy + embed
    let saver = Mutex::new(LedgerSaver::new(ledger, output_root.to_path_buf()));
    let writer_tool = (options.write_metadata && tool_usable).then_some(tool);
    let cancelled = AtomicBool::new(false);
    let counter = AtomicU64::new(0);
    let write_total = planned.len() as u64;

    pool.install(|| {
        planned.par_iter().for_each(|p| {
            if control.is_cancelled() {
                cancelled.store(true, Ordering::SeqCst);
                return;
            }
            let outcome = writer::execute(p, Transfer::Copy, writer_tool, &saver);
            acc.record(&p.file.path, &outcome);
            if let Outcome::Failed(reason) = &outcome {
                tracing::debug!(file = %p.file.path.display(), "failed: {}", reason);
            }
            let current = counter.fetch_add(1, Ordering::Relaxed);
            tp.report("write", current, write_total, "Writing files");
        })
    });

    saver.into_inner().unwrap_or_else(|e| e.into_inner()).force_save();

    let cancelled = cancelled.into_inner();
    if cancelled {
        tracing::warn!("run cancelled, in-flight files finished");
    }
    let summary = acc.finish(total, cancelled);
    log_summary(&summary);
    Ok(summary)
}

pub(crate) fn log_summary(summary: &RunSummary) {
    tracing::info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        moved_to_dated = summary.moved_to_dated,
        remained_unknown = summary.remained_unknown,
        skipped = summary.skipped,
        "run finished"
    );
    for f in &summary.failures {
        tracing::error!(file = %f.path.display(), "failed: {}", f.reason);
    }
}
