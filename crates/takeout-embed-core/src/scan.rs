use std::path::Path;

use walkdir::WalkDir;

use crate::media::MediaFile;
use crate::ThrottledProgress;

/// Recursively enumerate media files under `root`, sorted by path.
///
/// Anything under `exclude` (the output root, when it lives inside the
/// input) is skipped so earlier output is never reprocessed. macOS
/// resource-fork files (`._name`) are ignored.
pub fn scan_media(root: &Path, exclude: Option<&Path>, progress: &ThrottledProgress) -> Vec<MediaFile> {
    let mut media = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| exclude.map_or(true, |ex| e.path() != ex));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with("._") || name.starts_with('.') && name.ends_with(".part") {
            continue;
        }
        if let Some(m) = MediaFile::from_path(entry.path()) {
            media.push(m);
        }
    }

    media.sort_by(|a, b| a.path.cmp(&b.path));
    let n = media.len() as u64;
    progress.report("scan", n, n, &format!("Found {} media files", n));

    let videos = media.iter().filter(|m| m.is_video()).count();
    tracing::info!(
        "found {} media file(s) under {} ({} image(s), {} video(s))",
        media.len(),
        root.display(),
        media.len() - videos,
        videos
    );
    media
}
