//! Google Takeout sidecar JSON: discovery next to a media file and parsing.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context;
use chrono::NaiveDateTime;
use encoding_rs::WINDOWS_1252;
use regex::Regex;
use serde_json::Value;

use crate::extras;

/// Highest `(n)` tried for numbered sidecars.
const MAX_NUMBERED_SUFFIX: u32 = 99;
/// Takeout truncates sidecar names to this many bytes, `.json` included.
const MAX_SIDECAR_NAME_LEN: usize = 51;

static BRACKET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\d+\)\.").unwrap());

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gps {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// The fields of a sidecar this tool cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarMetadata {
    /// photoTakenTime, or creationTime when that is missing (local time)
    pub taken: Option<NaiveDateTime>,
    pub gps: Option<Gps>,
    pub people: Vec<String>,
    pub description: Option<String>,
    /// Google Photos URL, embedded as the external identifier
    pub url: Option<String>,
    /// Original media filename, used to verify sidecar matches
    pub title: Option<String>,
}

impl SidecarMetadata {
    /// True when the title is absent or names `media_name`.
    fn title_matches(&self, media_name: &str) -> bool {
        match &self.title {
            Some(title) => extras::nfc(title) == extras::nfc(media_name),
            None => true,
        }
    }
}

/// Find the sidecar belonging to a media file.
///
/// Tried in order: `name.ext.json`; `name.ext(1).json` .. `(99).json`
/// (rejected if their title names another file); the Takeout renames for
/// `name(1).ext`, truncated names and edited copies; finally any
/// `name.ext*.json` whose title equals the media name.
pub fn find_sidecar(media_path: &Path) -> Option<PathBuf> {
    let parent = media_path.parent()?;
    let media_name = media_path.file_name()?.to_str()?;

    let exact = parent.join(format!("{}.json", media_name));
    if exact.is_file() {
        return Some(exact);
    }

    for i in 1..=MAX_NUMBERED_SUFFIX {
        let numbered = parent.join(format!("{}({}).json", media_name, i));
        if !numbered.is_file() {
            continue;
        }
        match read_sidecar(&numbered) {
            Ok(meta) if !meta.title_matches(media_name) => {
                tracing::debug!(sidecar = %numbered.display(), "numbered sidecar belongs to another file");
            }
            _ => return Some(numbered),
        }
    }

    let derived: [fn(&str) -> String; 3] = [bracket_swap, shorten_name, extras::strip_edited_suffix];
    for transform in derived {
        let name = transform(media_name);
        if name == media_name {
            continue;
        }
        let candidate = parent.join(sidecar_file_name(&name));
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    find_by_title(parent, media_name)
}

fn sidecar_file_name(media_name: &str) -> String {
    let full = format!("{}.json", media_name);
    if full.len() <= MAX_SIDECAR_NAME_LEN {
        return full;
    }
    format!("{}.json", shorten_name(media_name))
}

/// Scan the directory for `<media_name>*.json` files and match on title.
fn find_by_title(dir: &Path, media_name: &str) -> Option<PathBuf> {
    let wanted = extras::nfc(media_name);
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|entry| {
            let name = extras::nfc(entry.file_name().to_str()?);
            let is_candidate =
                !name.starts_with("._") && name.starts_with(&wanted) && name.ends_with(".json");
            is_candidate.then(|| entry.path())
        })
        .collect();
    candidates.sort();

    candidates.into_iter().find(|path| {
        match read_sidecar(path) {
            Ok(meta) => meta.title.is_some() && meta.title_matches(media_name),
            Err(e) => {
                tracing::debug!(sidecar = %path.display(), "skipping unreadable JSON: {:#}", e);
                false
            }
        }
    })
}

/// `IMG(1).jpg` -> `IMG.jpg(1)`: Takeout moves the duplicate counter behind
/// the extension when naming the sidecar.
fn bracket_swap(filename: &str) -> String {
    if let Some(m) = BRACKET_RE.find_iter(filename).last() {
        let bracket = m.as_str().replace('.', "");
        if let Some(pos) = filename.rfind(&bracket) {
            let mut result = String::with_capacity(filename.len());
            result.push_str(&filename[..pos]);
            result.push_str(&filename[pos + bracket.len()..]);
            result.push_str(&bracket);
            return result;
        }
    }
    filename.to_string()
}

fn shorten_name(filename: &str) -> String {
    let max_len = MAX_SIDECAR_NAME_LEN - ".json".len();
    if filename.len() + ".json".len() > MAX_SIDECAR_NAME_LEN {
        let mut end = max_len;
        while end > 0 && !filename.is_char_boundary(end) {
            end -= 1;
        }
        filename[..end].to_string()
    } else {
        filename.to_string()
    }
}

/// Read and parse a sidecar file. Malformed JSON is an error here; callers
/// decide whether that matters.
pub fn read_sidecar(path: &Path) -> anyhow::Result<SidecarMetadata> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_google_json(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// UTF-8, falling back to Windows-1252 (a superset of Latin-1) for exports
/// written by older tools.
fn decode(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => {
            tracing::warn!("sidecar is not valid UTF-8, decoding as Windows-1252");
            let (decoded, _, _) = WINDOWS_1252.decode(bytes);
            decoded
        }
    }
}

/// Parse Google's JSON metadata.
pub fn parse_google_json(bytes: &[u8]) -> Result<SidecarMetadata, serde_json::Error> {
    let text = decode(bytes);
    let data: Value = serde_json::from_str(text.trim_start_matches('\u{feff}'))?;

    Ok(SidecarMetadata {
        taken: epoch_field(&data, "photoTakenTime").or_else(|| epoch_field(&data, "creationTime")),
        gps: gps(&data),
        people: people(&data),
        description: trimmed(&data, "description"),
        url: trimmed(&data, "url"),
        title: trimmed(&data, "title"),
    })
}

/// `{"<key>": {"timestamp": "1671587083"}}` as local time. Takeout writes
/// the epoch as a string; integers are accepted too.
fn epoch_field(data: &Value, key: &str) -> Option<NaiveDateTime> {
    let ts = data.get(key)?.get("timestamp")?;
    let epoch = match ts {
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    if epoch == 0 {
        return None;
    }
    let utc = chrono::DateTime::from_timestamp(epoch, 0)?;
    Some(utc.with_timezone(&chrono::Local).naive_local())
}

/// Takeout writes 0.0/0.0 when there is no location.
fn gps(data: &Value) -> Option<Gps> {
    let geo = data.get("geoData")?;
    let num = |k: &str| geo.get(k).and_then(Value::as_f64).unwrap_or(0.0);
    let (latitude, longitude) = (num("latitude"), num("longitude"));
    if latitude == 0.0 && longitude == 0.0 {
        return None;
    }
    Some(Gps {
        latitude,
        longitude,
        altitude: num("altitude"),
    })
}

fn people(data: &Value) -> Vec<String> {
    data.get("people")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|p| p.get("name")?.as_str())
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn trimmed(data: &Value, key: &str) -> Option<String> {
    let s = data.get(key)?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}
