//! Placement ledger stored in the output root.
//!
//! Records which source file was placed at which destination so a re-run
//! can recognise its own output even after metadata writing changed the
//! copy's bytes.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current ledger file format version
const LEDGER_VERSION: u32 = 1;

pub const LEDGER_FILENAME: &str = ".takeout-embed-ledger.json";
const LEDGER_TEMP_FILENAME: &str = ".takeout-embed-ledger.tmp";

/// Identity of a source file: its path plus size and mtime, so an edited
/// source is not mistaken for the one placed earlier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub modified: i64,
}

impl SourceIdentity {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let modified = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedFile {
    pub source: SourceIdentity,
    /// Destination relative to the output root
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub version: u32,
    pub updated: DateTime<Utc>,
    pub placed: Vec<PlacedFile>,
    #[serde(skip)]
    by_source: HashMap<PathBuf, usize>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            version: LEDGER_VERSION,
            updated: Utc::now(),
            placed: Vec::new(),
            by_source: HashMap::new(),
        }
    }

    fn reindex(&mut self) {
        self.by_source = self
            .placed
            .iter()
            .enumerate()
            .map(|(i, p)| (p.source.path.clone(), i))
            .collect();
    }

    /// Load the ledger from the output root. A missing file gives an empty
    /// ledger; an unreadable or foreign one is logged and replaced.
    pub fn load(output_root: &Path) -> Self {
        let path = output_root.join(LEDGER_FILENAME);
        if !path.exists() {
            return Self::new();
        }
        let loaded = File::open(&path)
            .map_err(anyhow::Error::from)
            .and_then(|f| Ok(serde_json::from_reader::<_, Ledger>(BufReader::new(f))?));
        match loaded {
            Ok(mut ledger) if ledger.version == LEDGER_VERSION => {
                ledger.reindex();
                tracing::info!("loaded ledger with {} placed file(s)", ledger.placed.len());
                ledger
            }
            Ok(ledger) => {
                tracing::warn!("ignoring ledger version {}", ledger.version);
                Self::new()
            }
            Err(e) => {
                tracing::warn!("ignoring unreadable ledger {}: {:#}", path.display(), e);
                Self::new()
            }
        }
    }

    /// Save to the output root (temp file + rename).
    pub fn save(&self, output_root: &Path) -> anyhow::Result<()> {
        let path = output_root.join(LEDGER_FILENAME);
        let temp_path = output_root.join(LEDGER_TEMP_FILENAME);

        let file = File::create(&temp_path)
            .with_context(|| format!("creating {}", temp_path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        fs::rename(&temp_path, &path).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Record that `source` now lives at `destination`.
    pub fn record(&mut self, source: SourceIdentity, destination: &Path, output_root: &Path) {
        let relative = pathdiff::diff_paths(destination, output_root)
            .unwrap_or_else(|| destination.to_path_buf());
        let entry = PlacedFile {
            source,
            destination: relative,
        };
        match self.by_source.get(&entry.source.path) {
            Some(&i) => self.placed[i] = entry,
            None => {
                self.by_source.insert(entry.source.path.clone(), self.placed.len());
                self.placed.push(entry);
            }
        }
        self.updated = Utc::now();
    }

    /// Where an unchanged `source` was placed, as an absolute path.
    pub fn destination_of(&self, source: &SourceIdentity, output_root: &Path) -> Option<PathBuf> {
        let entry = &self.placed[*self.by_source.get(&source.path)?];
        (entry.source == *source).then(|| output_root.join(&entry.destination))
    }

    /// Point every entry placed at `from` to `to` (after a move).
    pub fn relocate(&mut self, from: &Path, to: &Path, output_root: &Path) {
        let rel = |p: &Path| pathdiff::diff_paths(p, output_root).unwrap_or_else(|| p.to_path_buf());
        let (from, to) = (rel(from), rel(to));
        for entry in self.placed.iter_mut().filter(|e| e.destination == from) {
            entry.destination = to.clone();
        }
        self.updated = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.placed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placed.is_empty()
    }
}

/// Saves the ledger at most every few seconds or every N records.
pub struct LedgerSaver {
    ledger: Ledger,
    output_root: PathBuf,
    last_save: Instant,
    records_since_save: usize,
    min_interval: Duration,
    min_records: usize,
}

impl LedgerSaver {
    pub fn new(ledger: Ledger, output_root: PathBuf) -> Self {
        Self {
            ledger,
            output_root,
            last_save: Instant::now(),
            records_since_save: 0,
            min_interval: Duration::from_secs(5),
            min_records: 100,
        }
    }

    pub fn record(&mut self, source: SourceIdentity, destination: &Path) {
        self.ledger.record(source, destination, &self.output_root);
        self.touched();
    }

    pub fn relocate(&mut self, from: &Path, to: &Path) {
        self.ledger.relocate(from, to, &self.output_root);
        self.touched();
    }

    fn touched(&mut self) {
        self.records_since_save += 1;
        if self.last_save.elapsed() >= self.min_interval || self.records_since_save >= self.min_records {
            self.force_save();
        }
    }

    /// Save now. Failures are logged; the ledger is an optimisation for
    /// re-runs, not a correctness requirement of this run.
    pub fn force_save(&mut self) {
        if let Err(e) = self.ledger.save(&self.output_root) {
            tracing::warn!("could not save ledger: {:#}", e);
        }
        self.last_save = Instant::now();
        self.records_since_save = 0;
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn identity(dir: &Path, name: &str, body: &[u8]) -> SourceIdentity {
        let path = dir.join(name);
        File::create(&path).unwrap().write_all(body).unwrap();
        SourceIdentity::of(&path).unwrap()
    }

    #[test]
    fn test_ledger_save_load() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Output");
        fs::create_dir_all(&root).unwrap();
        let src = identity(dir.path(), "a.jpg", b"abc");

        let mut ledger = Ledger::new();
        ledger.record(src.clone(), &root.join("2022/December/a.jpg"), &root);
        ledger.save(&root).unwrap();

        let loaded = Ledger::load(&root);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.placed[0].destination, PathBuf::from("2022/December/a.jpg"));
        assert_eq!(
            loaded.destination_of(&src, &root),
            Some(root.join("2022/December/a.jpg"))
        );
    }

    #[test]
    fn test_changed_source_not_matched() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let src = identity(root, "a.jpg", b"abc");
        let mut ledger = Ledger::new();
        ledger.record(src.clone(), &root.join("Unknown/a.jpg"), root);

        let mut changed = src.clone();
        changed.size += 1;
        assert!(ledger.destination_of(&changed, root).is_none());
    }

    #[test]
    fn test_record_replaces_and_relocate() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let src = identity(root, "a.jpg", b"abc");
        let mut ledger = Ledger::new();
        ledger.record(src.clone(), &root.join("Unknown/a.jpg"), root);
        ledger.record(src.clone(), &root.join("Unknown/a_1.jpg"), root);
        assert_eq!(ledger.len(), 1);

        ledger.relocate(&root.join("Unknown/a_1.jpg"), &root.join("2020/March/a_1.jpg"), root);
        assert_eq!(
            ledger.destination_of(&src, root),
            Some(root.join("2020/March/a_1.jpg"))
        );
    }

    #[test]
    fn test_corrupt_ledger_starts_fresh() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LEDGER_FILENAME), b"{ nope").unwrap();
        assert!(Ledger::load(dir.path()).is_empty());
    }

    #[test]
    fn test_saver_throttles() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let src = identity(&root, "a.jpg", b"abc");
        let mut saver = LedgerSaver::new(Ledger::new(), root.clone());
        saver.record(src, &root.join("Unknown/a.jpg"));
        assert!(!root.join(LEDGER_FILENAME).exists());
        saver.force_save();
        assert!(root.join(LEDGER_FILENAME).exists());
        assert_eq!(saver.ledger().len(), 1);
    }
}
