//! Gathers date evidence for one media file from its sidecar, its embedded
//! tags and the filesystem. Absent sources are simply `None`.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Local, NaiveDateTime};

use crate::date::exif::{self, EmbeddedDates};
use crate::date::{DateSource, DateVerdict};
use crate::exiftool::{MetadataFields, MetadataTool};
use crate::media::{MediaFile, MediaKind};
use crate::sidecar::{self, SidecarMetadata};

/// Embedded dates this close to the resolved date are considered already
/// written.
const MATCH_TOLERANCE_SECS: i64 = 60;

#[derive(Debug, Clone, Default)]
pub struct MetadataEvidence {
    pub sidecar: Option<SidecarMetadata>,
    pub embedded: EmbeddedDates,
    pub file_modified: Option<NaiveDateTime>,
}

impl MetadataEvidence {
    /// The timestamp a source holds. Sibling inference is not stored here.
    pub fn timestamp(&self, source: DateSource) -> Option<NaiveDateTime> {
        match source {
            DateSource::SidecarJson => self.sidecar.as_ref().and_then(|s| s.taken),
            DateSource::EmbeddedOriginal => self.embedded.original,
            DateSource::EmbeddedCreate => self.embedded.create,
            DateSource::EmbeddedModify => self.embedded.modify,
            DateSource::FilesystemModifiedTime => self.file_modified,
            DateSource::SiblingInference => None,
        }
    }

    /// True when the file already carries `date` as its DateTimeOriginal.
    pub fn already_embedded(&self, date: NaiveDateTime) -> bool {
        self.embedded
            .original
            .is_some_and(|orig| (orig - date).num_seconds().abs() <= MATCH_TOLERANCE_SECS)
    }

    /// Fields to write into the destination copy for this verdict.
    pub fn fields_to_write(&self, verdict: &DateVerdict, kind: MediaKind) -> MetadataFields {
        let datetime = verdict.date().filter(|d| !self.already_embedded(*d));
        let mut fields = MetadataFields {
            datetime,
            ..Default::default()
        };
        if let Some(sc) = &self.sidecar {
            fields.gps = sc.gps;
            fields.people = sc.people.clone();
            fields.description = sc.description.clone();
            fields.identifier = sc.url.clone();
        }
        fields.for_kind(kind)
    }
}

/// Collect all evidence for `file`. Never fails: unreadable sources are
/// logged and left empty.
pub fn extract(file: &MediaFile, tool: Option<&dyn MetadataTool>) -> MetadataEvidence {
    let sidecar = sidecar::find_sidecar(&file.path).and_then(|json| match sidecar::read_sidecar(&json) {
        Ok(meta) => {
            tracing::debug!(file = %file.filename, sidecar = %json.display(), "paired sidecar");
            Some(meta)
        }
        Err(e) => {
            tracing::warn!(file = %file.filename, "ignoring malformed sidecar: {:#}", e);
            None
        }
    });

    MetadataEvidence {
        sidecar,
        embedded: embedded_dates(file, tool),
        file_modified: file_mtime(&file.path),
    }
}

/// Images are read in-process first; the external tool covers videos and
/// formats the EXIF reader does not understand.
fn embedded_dates(file: &MediaFile, tool: Option<&dyn MetadataTool>) -> EmbeddedDates {
    if file.kind == MediaKind::Image {
        if let Some(dates) = exif::read_embedded_dates(&file.path).filter(|d| !d.is_empty()) {
            return dates;
        }
    }
    let Some(tool) = tool else {
        return EmbeddedDates::default();
    };
    match tool.read_dates(&file.path) {
        Ok(dates) => dates,
        Err(e) => {
            tracing::warn!(file = %file.filename, "could not read embedded dates: {}", e);
            EmbeddedDates::default()
        }
    }
}

/// Filesystem modification time as local time.
pub fn file_mtime(path: &Path) -> Option<NaiveDateTime> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Local>::from(modified).naive_local())
}
