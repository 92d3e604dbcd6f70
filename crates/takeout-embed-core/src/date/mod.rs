pub mod exif;
pub mod sibling;

use chrono::{Datelike, Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::evidence::MetadataEvidence;

/// Where a resolved date came from, in priority order (highest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DateSource {
    SidecarJson,
    EmbeddedOriginal,
    EmbeddedCreate,
    EmbeddedModify,
    FilesystemModifiedTime,
    SiblingInference,
}

impl DateSource {
    /// Sources read from the file itself or its sidecar. These are trusted
    /// without the minimum-age gate.
    pub const DIRECT: [DateSource; 4] = [
        DateSource::SidecarJson,
        DateSource::EmbeddedOriginal,
        DateSource::EmbeddedCreate,
        DateSource::EmbeddedModify,
    ];

    pub fn is_direct(self) -> bool {
        Self::DIRECT.contains(&self)
    }

    pub fn label(self) -> &'static str {
        match self {
            DateSource::SidecarJson => "sidecar JSON",
            DateSource::EmbeddedOriginal => "DateTimeOriginal",
            DateSource::EmbeddedCreate => "CreateDate",
            DateSource::EmbeddedModify => "ModifyDate",
            DateSource::FilesystemModifiedTime => "file mtime",
            DateSource::SiblingInference => "sibling file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    NoEvidence,
    FutureDate,
    /// Before the minimum year
    TooOld,
    /// Modified within the minimum age window
    TooRecent,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::NoEvidence => "no date evidence",
            RejectReason::FutureDate => "date is in the future",
            RejectReason::TooOld => "date is before the minimum year",
            RejectReason::TooRecent => "file modified too recently",
        };
        f.write_str(s)
    }
}

/// Result of date resolution for one file.
///
/// When `accepted` is true, `timestamp` is set and lies inside the validity
/// window. Rejected verdicts carry the timestamp and source that failed, if
/// any source had one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateVerdict {
    pub timestamp: Option<NaiveDateTime>,
    pub source: Option<DateSource>,
    pub accepted: bool,
    pub reject_reason: Option<RejectReason>,
}

impl DateVerdict {
    pub fn accepted(timestamp: NaiveDateTime, source: DateSource) -> Self {
        Self {
            timestamp: Some(timestamp),
            source: Some(source),
            accepted: true,
            reject_reason: None,
        }
    }

    pub fn rejected(
        reason: RejectReason,
        source: Option<DateSource>,
        timestamp: Option<NaiveDateTime>,
    ) -> Self {
        Self {
            timestamp,
            source,
            accepted: false,
            reject_reason: Some(reason),
        }
    }

    pub fn no_evidence() -> Self {
        Self::rejected(RejectReason::NoEvidence, None, None)
    }

    /// The accepted date, if any.
    pub fn date(&self) -> Option<NaiveDateTime> {
        if self.accepted {
            self.timestamp
        } else {
            None
        }
    }

    /// True when no direct source decided this verdict, so sibling inference
    /// could still change it.
    pub fn awaits_inference(&self) -> bool {
        !self.accepted && !self.source.is_some_and(DateSource::is_direct)
    }
}

pub const DEFAULT_MIN_AGE_DAYS: i64 = 30;
pub const DEFAULT_MIN_YEAR: i32 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    /// Fall back to the filesystem modification time.
    pub use_file_mtime: bool,
    /// An mtime younger than this many days is not trusted.
    pub min_age_days: i64,
    /// Dates before January 1st of this year are rejected.
    pub min_year: i32,
    /// Consult the sibling index when nothing else matched.
    pub guess_from_siblings: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            use_file_mtime: false,
            min_age_days: DEFAULT_MIN_AGE_DAYS,
            min_year: DEFAULT_MIN_YEAR,
            guess_from_siblings: false,
        }
    }
}

/// Year/future window applied to every source.
pub fn check_window(ts: NaiveDateTime, now: NaiveDateTime, min_year: i32) -> Result<(), RejectReason> {
    if ts > now {
        Err(RejectReason::FutureDate)
    } else if ts.year() < min_year {
        Err(RejectReason::TooOld)
    } else {
        Ok(())
    }
}

/// Minimum-age gate, applied to the filesystem mtime only.
pub fn check_age(ts: NaiveDateTime, now: NaiveDateTime, min_age_days: i64) -> Result<(), RejectReason> {
    if now - ts < Duration::days(min_age_days) {
        Err(RejectReason::TooRecent)
    } else {
        Ok(())
    }
}

/// Resolve a single capture date from the available evidence.
///
/// Sources are tried in priority order and the first one holding a
/// timestamp decides: sidecar and embedded tags are accepted if they fall
/// inside the year/future window and rejected otherwise, without looking
/// further. The file mtime additionally has to be older than
/// `min_age_days`; when it fails, resolution falls through to the sibling
/// lookup, which is only evaluated if it is reached.
pub fn resolve<F>(
    evidence: &MetadataEvidence,
    options: &ResolveOptions,
    now: NaiveDateTime,
    sibling: F,
) -> DateVerdict
where
    F: FnOnce() -> Option<NaiveDateTime>,
{
    for source in DateSource::DIRECT {
        if let Some(ts) = evidence.timestamp(source) {
            return match check_window(ts, now, options.min_year) {
                Ok(()) => DateVerdict::accepted(ts, source),
                Err(reason) => DateVerdict::rejected(reason, Some(source), Some(ts)),
            };
        }
    }

    let mut verdict = DateVerdict::no_evidence();

    if options.use_file_mtime {
        if let Some(ts) = evidence.file_modified {
            let source = DateSource::FilesystemModifiedTime;
            match check_window(ts, now, options.min_year)
                .and_then(|_| check_age(ts, now, options.min_age_days))
            {
                Ok(()) => return DateVerdict::accepted(ts, source),
                Err(reason) => verdict = DateVerdict::rejected(reason, Some(source), Some(ts)),
            }
        }
    }

    if options.guess_from_siblings {
        if let Some(ts) = sibling() {
            let source = DateSource::SiblingInference;
            match check_window(ts, now, options.min_year) {
                Ok(()) => return DateVerdict::accepted(ts, source),
                Err(reason) => verdict = DateVerdict::rejected(reason, Some(source), Some(ts)),
            }
        }
    }

    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::exif::EmbeddedDates;
    use crate::sidecar::SidecarMetadata;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    fn now() -> NaiveDateTime {
        at(2024, 6, 15)
    }

    fn sidecar_at(ts: NaiveDateTime) -> Option<SidecarMetadata> {
        Some(SidecarMetadata {
            taken: Some(ts),
            ..Default::default()
        })
    }

    fn mtime_only(ts: NaiveDateTime) -> MetadataEvidence {
        MetadataEvidence {
            file_modified: Some(ts),
            ..Default::default()
        }
    }

    fn with_mtime() -> ResolveOptions {
        ResolveOptions {
            use_file_mtime: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_highest_priority_source_wins() {
        let all = MetadataEvidence {
            sidecar: sidecar_at(at(2010, 1, 1)),
            embedded: EmbeddedDates {
                original: Some(at(2011, 1, 1)),
                create: Some(at(2012, 1, 1)),
                modify: Some(at(2013, 1, 1)),
            },
            file_modified: Some(at(2014, 1, 1)),
        };
        let opts = with_mtime();
        let v = resolve(&all, &opts, now(), || Some(at(2015, 1, 1)));
        assert!(v.accepted);
        assert_eq!(v.timestamp, Some(at(2010, 1, 1)));
        assert_eq!(v.source, Some(DateSource::SidecarJson));

        let mut e = all.clone();
        e.sidecar = None;
        let v = resolve(&e, &opts, now(), || None);
        assert_eq!((v.timestamp, v.source), (Some(at(2011, 1, 1)), Some(DateSource::EmbeddedOriginal)));

        e.embedded.original = None;
        let v = resolve(&e, &opts, now(), || None);
        assert_eq!((v.timestamp, v.source), (Some(at(2012, 1, 1)), Some(DateSource::EmbeddedCreate)));

        e.embedded.create = None;
        let v = resolve(&e, &opts, now(), || None);
        assert_eq!((v.timestamp, v.source), (Some(at(2013, 1, 1)), Some(DateSource::EmbeddedModify)));
    }

    #[test]
    fn test_sidecar_without_timestamp_is_skipped() {
        let e = MetadataEvidence {
            sidecar: Some(SidecarMetadata {
                description: Some("beach".into()),
                ..Default::default()
            }),
            embedded: EmbeddedDates {
                create: Some(at(2019, 4, 4)),
                ..Default::default()
            },
            ..Default::default()
        };
        let v = resolve(&e, &ResolveOptions::default(), now(), || None);
        assert_eq!(v.source, Some(DateSource::EmbeddedCreate));
    }

    #[test]
    fn test_min_age_boundary() {
        let opts = with_mtime();
        let v = resolve(&mtime_only(now() - Duration::days(29)), &opts, now(), || None);
        assert!(!v.accepted);
        assert_eq!(v.reject_reason, Some(RejectReason::TooRecent));
        assert_eq!(v.source, Some(DateSource::FilesystemModifiedTime));

        let v = resolve(&mtime_only(now() - Duration::days(30)), &opts, now(), || None);
        assert!(v.accepted);
        assert_eq!(v.source, Some(DateSource::FilesystemModifiedTime));
    }

    #[test]
    fn test_year_floor() {
        let opts = with_mtime();
        let v = resolve(&mtime_only(at(1999, 12, 31)), &opts, now(), || None);
        assert_eq!(v.reject_reason, Some(RejectReason::TooOld));

        let start = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert!(resolve(&mtime_only(start), &opts, now(), || None).accepted);

        // high-provenance sources are held to the same floor
        let e = MetadataEvidence {
            sidecar: sidecar_at(at(1999, 6, 1)),
            file_modified: Some(at(2020, 1, 1)),
            ..Default::default()
        };
        let v = resolve(&e, &opts, now(), || None);
        assert!(!v.accepted);
        assert_eq!(v.reject_reason, Some(RejectReason::TooOld));
        assert_eq!(v.source, Some(DateSource::SidecarJson));
    }

    #[test]
    fn test_future_by_one_second() {
        let future = now() + Duration::seconds(1);
        let v = resolve(&mtime_only(future), &with_mtime(), now(), || None);
        assert_eq!(v.reject_reason, Some(RejectReason::FutureDate));

        let e = MetadataEvidence {
            embedded: EmbeddedDates {
                original: Some(future),
                ..Default::default()
            },
            ..Default::default()
        };
        let v = resolve(&e, &ResolveOptions::default(), now(), || None);
        assert_eq!(v.reject_reason, Some(RejectReason::FutureDate));
    }

    #[test]
    fn test_embedded_skips_age_gate() {
        let recent = now() - Duration::days(1);
        let e = MetadataEvidence {
            embedded: EmbeddedDates {
                modify: Some(recent),
                ..Default::default()
            },
            ..Default::default()
        };
        let v = resolve(&e, &ResolveOptions::default(), now(), || None);
        assert!(v.accepted);
        assert_eq!(v.timestamp, Some(recent));
    }

    #[test]
    fn test_mtime_ignored_unless_enabled() {
        let e = mtime_only(at(2015, 1, 1));
        let v = resolve(&e, &ResolveOptions::default(), now(), || None);
        assert_eq!(v, DateVerdict::no_evidence());
    }

    #[test]
    fn test_rejected_mtime_falls_through_to_sibling() {
        let opts = ResolveOptions {
            use_file_mtime: true,
            guess_from_siblings: true,
            ..Default::default()
        };
        let e = mtime_only(now() - Duration::days(3));
        let v = resolve(&e, &opts, now(), || Some(at(2021, 5, 1)));
        assert!(v.accepted);
        assert_eq!(v.source, Some(DateSource::SiblingInference));

        let v = resolve(&e, &opts, now(), || None);
        assert_eq!(v.reject_reason, Some(RejectReason::TooRecent));
        assert!(v.awaits_inference());
    }

    #[test]
    fn test_sibling_not_consulted_when_disabled_or_decided() {
        let e = MetadataEvidence::default();
        let v = resolve(&e, &ResolveOptions::default(), now(), || panic!("consulted"));
        assert_eq!(v.reject_reason, Some(RejectReason::NoEvidence));

        let opts = ResolveOptions {
            guess_from_siblings: true,
            ..Default::default()
        };
        let e = MetadataEvidence {
            sidecar: sidecar_at(at(2030, 1, 1)),
            ..Default::default()
        };
        let v = resolve(&e, &opts, now(), || panic!("consulted"));
        assert_eq!(v.reject_reason, Some(RejectReason::FutureDate));
        assert!(!v.awaits_inference());
    }
}
