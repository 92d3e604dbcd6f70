//! Date inference from sequentially numbered sibling files.
//!
//! Cameras number their output (`IMG_3689.JPG`, `IMG_3690.JPG`, ...), so a
//! file with no date evidence of its own is very likely close in time to the
//! nearest dated file of the same sequence. The index is keyed by the
//! filename with its number masked out and is shared between workers; each
//! stem has its own lock so inserts and lookups on one sequence are
//! serialized without blocking the others.
//!
//! What the index contains depends on the order files were resolved in: a
//! lookup only sees entries inserted before it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex};

use chrono::NaiveDateTime;
use regex::Regex;

use crate::media::MediaFile;

/// Default maximum numeric distance for inference.
pub const DEFAULT_MAX_DISTANCE: u64 = 100;

static LONG_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{3,}").unwrap());
static ANY_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// A filename split into its sequence number and the masked stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericToken {
    pub number: u64,
    pub stem_key: String,
}

/// Extract the sequence number of a filename.
///
/// The first run of three or more digits wins (`DSC_8217` -> 8217,
/// `VID20220101` -> 20220101); otherwise the last run of digits is used
/// (`photo_7` -> 7). The extension is never considered.
pub fn numeric_token(filename: &str) -> Option<NumericToken> {
    let stem = Path::new(filename).file_stem()?.to_str()?;
    let m = LONG_RUN_RE
        .find(stem)
        .or_else(|| ANY_RUN_RE.find_iter(stem).last())?;
    let number = m.as_str().parse::<u64>().ok()?;
    let stem_key = format!(
        "{}#{}",
        stem[..m.start()].to_lowercase(),
        stem[m.end()..].to_lowercase()
    );
    Some(NumericToken { number, stem_key })
}

/// The nearest dated sibling found for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingMatch {
    pub number: u64,
    pub date: NaiveDateTime,
    pub distance: u64,
}

type StemEntries = Arc<Mutex<BTreeMap<u64, NaiveDateTime>>>;

#[derive(Debug, Default)]
pub struct SiblingIndex {
    stems: Mutex<HashMap<String, StemEntries>>,
}

impl SiblingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self, stem_key: &str) -> Option<StemEntries> {
        self.stems.lock().unwrap().get(stem_key).cloned()
    }

    /// Record a resolved date. When two files share a number (a photo and
    /// its video twin), the earlier date is kept.
    pub fn insert(&self, stem_key: &str, number: u64, date: NaiveDateTime) {
        let entries = self
            .stems
            .lock()
            .unwrap()
            .entry(stem_key.to_string())
            .or_default()
            .clone();
        let mut entries = entries.lock().unwrap();
        entries
            .entry(number)
            .and_modify(|d| *d = (*d).min(date))
            .or_insert(date);
    }

    /// Record a file's accepted date, if it carries a numeric token.
    pub fn insert_file(&self, file: &MediaFile, date: NaiveDateTime) {
        if let (Some(key), Some(number)) = (&file.stem_key, file.number) {
            self.insert(key, number, date);
        }
    }

    /// Nearest entry within `max_distance`; ties go to the smaller number.
    pub fn nearest(&self, stem_key: &str, number: u64, max_distance: u64) -> Option<SiblingMatch> {
        let entries = self.entries(stem_key)?;
        let entries = entries.lock().unwrap();
        let lo = number.saturating_sub(max_distance);
        let hi = number.saturating_add(max_distance);
        entries
            .range(lo..=hi)
            .map(|(&n, &date)| SiblingMatch {
                number: n,
                date,
                distance: n.abs_diff(number),
            })
            .min_by_key(|m| (m.distance, m.number))
    }

    #[cfg(test)]
    fn stem_count(&self) -> usize {
        self.stems.lock().unwrap().len()
    }
}

/// Propose a date for `file` from the nearest dated sibling.
pub fn infer(file: &MediaFile, index: &SiblingIndex, max_distance: u64) -> Option<SiblingMatch> {
    let key = file.stem_key.as_deref()?;
    let number = file.number?;
    let found = index.nearest(key, number, max_distance);
    match &found {
        Some(m) => tracing::debug!(
            file = %file.filename,
            sibling = m.number,
            distance = m.distance,
            "inferred date from sibling"
        ),
        None => tracing::debug!(file = %file.filename, "no dated sibling in range"),
    }
    found
}
