//! ExifTool wrapper: reads embedded dates and writes resolved metadata.
//!
//! The pipeline talks to the tool through the [`MetadataTool`] trait so it
//! can run against a recording double in tests.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::date::exif::{parse_exif_datetime, EmbeddedDates};
use crate::media::MediaKind;
use crate::sidecar::Gps;

/// Environment variable overriding the exiftool location.
pub const EXIFTOOL_ENV: &str = "TAKEOUT_EMBED_EXIFTOOL";

const KNOWN_LOCATIONS: &[&str] = &[
    "/opt/homebrew/bin/exiftool",
    "/usr/local/bin/exiftool",
    "/usr/bin/exiftool",
];

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("exiftool not found (set TAKEOUT_EMBED_EXIFTOOL or install it on PATH)")]
    NotFound,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exiftool exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("exiftool timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected exiftool output: {0}")]
    Output(String),
}

/// Values to embed into a destination file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFields {
    pub datetime: Option<NaiveDateTime>,
    pub gps: Option<Gps>,
    pub people: Vec<String>,
    pub description: Option<String>,
    pub identifier: Option<String>,
}

impl MetadataFields {
    pub fn is_empty(&self) -> bool {
        self.datetime.is_none()
            && self.gps.is_none()
            && self.people.is_empty()
            && self.description.is_none()
            && self.identifier.is_none()
    }

    /// Videos only carry timestamps.
    pub fn for_kind(mut self, kind: MediaKind) -> Self {
        if kind == MediaKind::Video {
            self.gps = None;
            self.people.clear();
            self.description = None;
            self.identifier = None;
        }
        self
    }
}

/// A metadata reader/writer for media files.
pub trait MetadataTool: Send + Sync {
    /// Probe the tool; Err means it cannot be used at all.
    fn version(&self) -> Result<String, ToolError>;

    fn read_dates(&self, path: &Path) -> Result<EmbeddedDates, ToolError>;

    /// Write `fields` into the file at `path`, in place.
    fn write(&self, path: &Path, kind: MediaKind, fields: &MetadataFields) -> Result<(), ToolError>;
}

#[derive(Debug, Clone)]
pub struct ExifTool {
    program: PathBuf,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl ExifTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    /// Resolve the binary: environment override, PATH, well-known install
    /// locations.
    pub fn locate() -> Result<Self, ToolError> {
        if let Ok(v) = std::env::var(EXIFTOOL_ENV) {
            let p = PathBuf::from(&v);
            if p.is_file() {
                return Ok(Self::new(p));
            }
            tracing::warn!("{} points to missing file {}", EXIFTOOL_ENV, v);
        }
        if let Ok(p) = which::which("exiftool") {
            return Ok(Self::new(p));
        }
        KNOWN_LOCATIONS
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
            .map(Self::new)
            .ok_or(ToolError::NotFound)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn run(&self, args: &[String], timeout: Duration) -> Result<Output, ToolError> {
        let output = run_with_timeout(&self.program, args, timeout)?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl MetadataTool for ExifTool {
    fn version(&self) -> Result<String, ToolError> {
        let output = self.run(&["-ver".to_string()], VERSION_TIMEOUT)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn read_dates(&self, path: &Path) -> Result<EmbeddedDates, ToolError> {
        let args = vec![
            "-j".to_string(),
            "-DateTimeOriginal".to_string(),
            "-CreateDate".to_string(),
            "-ModifyDate".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        let output = self.run(&args, self.read_timeout)?;
        parse_read_output(&output.stdout)
    }

    fn write(&self, path: &Path, kind: MediaKind, fields: &MetadataFields) -> Result<(), ToolError> {
        let mut args = match kind {
            MediaKind::Image => image_args(fields),
            MediaKind::Video => video_args(fields),
        };
        args.push(path.to_string_lossy().into_owned());
        tracing::debug!(file = %path.display(), "running exiftool {}", args.join(" "));
        self.run(&args, self.write_timeout)?;
        Ok(())
    }
}

/// Spawn `program` and wait at most `timeout`; the child is killed when the
/// deadline passes. Output pipes are drained on helper threads so a chatty
/// child cannot block on a full pipe.
fn run_with_timeout(program: &Path, args: &[String], timeout: Duration) -> Result<Output, ToolError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ToolError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    let drain = |pipe: Option<Box<dyn Read + Send>>| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = pipe {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        })
    };
    let stdout = drain(child.stdout.take().map(|p| Box::new(p) as Box<dyn Read + Send>));
    let stderr = drain(child.stderr.take().map(|p| Box::new(p) as Box<dyn Read + Send>));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::Timeout(timeout));
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(source) => {
                return Err(ToolError::Spawn {
                    program: program.display().to_string(),
                    source,
                })
            }
        }
    };

    Ok(Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

/// Parse `exiftool -j` output for the three date tags.
fn parse_read_output(stdout: &[u8]) -> Result<EmbeddedDates, ToolError> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|e| ToolError::Output(e.to_string()))?;
    let record = value
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| ToolError::Output("expected a JSON array".to_string()))?;
    let tag = |name: &str| {
        record
            .get(name)
            .and_then(|v| v.as_str())
            .and_then(parse_exif_datetime)
    };
    Ok(EmbeddedDates {
        original: tag("DateTimeOriginal"),
        create: tag("CreateDate"),
        modify: tag("ModifyDate"),
    })
}

fn format_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y:%m:%d %H:%M:%S").to_string()
}

/// Arguments for writing image tags (file path not included).
pub fn image_args(fields: &MetadataFields) -> Vec<String> {
    let mut args = vec!["-overwrite_original".to_string()];

    if let Some(dt) = &fields.datetime {
        let s = format_datetime(dt);
        args.push(format!("-DateTimeOriginal={}", s));
        args.push(format!("-CreateDate={}", s));
        args.push(format!("-ModifyDate={}", s));
    }

    if let Some(gps) = &fields.gps {
        let lat_ref = if gps.latitude < 0.0 { "S" } else { "N" };
        let lon_ref = if gps.longitude < 0.0 { "W" } else { "E" };
        let alt_ref = if gps.altitude < 0.0 { "1" } else { "0" };
        args.push(format!("-GPSLatitude={}", gps.latitude.abs()));
        args.push(format!("-GPSLatitudeRef={}", lat_ref));
        args.push(format!("-GPSLongitude={}", gps.longitude.abs()));
        args.push(format!("-GPSLongitudeRef={}", lon_ref));
        args.push(format!("-GPSAltitude={}", gps.altitude.abs()));
        args.push(format!("-GPSAltitudeRef={}", alt_ref));
    }

    for person in &fields.people {
        args.push(format!("-XMP:PersonInImage+={}", person));
        args.push(format!("-IPTC:Keywords+={}", person));
    }

    if let Some(desc) = &fields.description {
        args.push(format!("-ImageDescription={}", desc));
    }

    if let Some(id) = &fields.identifier {
        args.push(format!("-XMP:Identifier={}", id));
    }

    args
}

/// Arguments for writing video tags: QuickTime containers only get dates.
pub fn video_args(fields: &MetadataFields) -> Vec<String> {
    let mut args = vec!["-overwrite_original".to_string()];
    if let Some(dt) = &fields.datetime {
        let s = format_datetime(dt);
        args.push(format!("-QuickTime:CreateDate={}", s));
        args.push(format!("-QuickTime:ModifyDate={}", s));
        args.push(format!("-XMP:DateCreated={}", s));
    }
    args
}
