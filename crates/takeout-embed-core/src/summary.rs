use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::planner::Bucket;
use crate::writer::Outcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Counters for one run, snapshotted when the run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub moved_to_dated: u64,
    pub remained_unknown: u64,
    /// Already processed by an earlier run
    pub skipped: u64,
    /// The run was cancelled before every file was dispatched.
    pub cancelled: bool,
    pub failures: Vec<FileFailure>,
}

impl RunSummary {
    /// No failures and not cancelled.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// Thread-safe accumulator the workers report into.
#[derive(Debug, Default)]
pub struct SummaryAccumulator {
    succeeded: AtomicU64,
    moved_to_dated: AtomicU64,
    remained_unknown: AtomicU64,
    skipped: AtomicU64,
    failures: Mutex<Vec<FileFailure>>,
}

impl SummaryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: &Path, outcome: &Outcome) {
        match outcome {
            Outcome::Placed(Bucket::Dated) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.moved_to_dated.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Placed(Bucket::Unknown) => self.unresolved(),
            Outcome::AlreadyPresent => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failed(reason) => self.fail(path, reason.clone()),
        }
    }

    /// A file that ends the run in the Unknown bucket without error.
    pub fn unresolved(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.remained_unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fail(&self, path: &Path, reason: String) {
        self.failures.lock().unwrap().push(FileFailure {
            path: path.to_path_buf(),
            reason,
        });
    }

    pub fn finish(self, total: u64, cancelled: bool) -> RunSummary {
        let mut failures = self.failures.into_inner().unwrap_or_else(|e| e.into_inner());
        failures.sort_by(|a, b| a.path.cmp(&b.path));
        RunSummary {
            total,
            succeeded: self.succeeded.into_inner(),
            failed: failures.len() as u64,
            moved_to_dated: self.moved_to_dated.into_inner(),
            remained_unknown: self.remained_unknown.into_inner(),
            skipped: self.skipped.into_inner(),
            cancelled,
            failures,
        }
    }
}
