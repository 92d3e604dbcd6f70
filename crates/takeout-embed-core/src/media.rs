use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::date::sibling;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "heic", "webp", "dng", "nef"];
const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4", "avi"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify by extension, falling back to the MIME table for anything
    /// outside the known lists.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return Some(MediaKind::Image);
        }
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            return Some(MediaKind::Video);
        }
        let mime = mime_guess::from_ext(&ext).first()?;
        if mime.type_() == mime_guess::mime::IMAGE {
            Some(MediaKind::Image)
        } else if mime.type_() == mime_guess::mime::VIDEO {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaFile {
    /// Absolute path of the source file
    pub path: PathBuf,
    /// Just the filename
    pub filename: String,
    pub kind: MediaKind,
    /// Numeric token used for sibling matching (`IMG_3689.JPG` -> 3689)
    pub number: Option<u64>,
    /// Filename stem with the numeric token masked out (`img_#`)
    pub stem_key: Option<String>,
}

impl MediaFile {
    /// Build a MediaFile from a path, or None if it is not a media file.
    pub fn from_path(path: &Path) -> Option<Self> {
        let kind = MediaKind::from_path(path)?;
        let filename = path.file_name()?.to_str()?.to_string();
        let token = sibling::numeric_token(&filename);
        Some(Self {
            path: path.to_path_buf(),
            kind,
            number: token.as_ref().map(|t| t.number),
            stem_key: token.map(|t| t.stem_key),
            filename,
        })
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a/IMG_1.JPG")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("clip.MoV")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("photo.tiff")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("IMG_1.JPG.json")), None);
        assert_eq!(MediaKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn test_media_file_token() {
        let m = MediaFile::from_path(Path::new("/x/IMG_3689.JPG")).unwrap();
        assert_eq!(m.filename, "IMG_3689.JPG");
        assert_eq!(m.number, Some(3689));
        assert_eq!(m.stem_key.as_deref(), Some("img_#"));
        assert!(!m.is_video());
    }
}
