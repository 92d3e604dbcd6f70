use unicode_normalization::UnicodeNormalization;

/// Localized suffixes Google Photos appends to edited copies (lowercase).
/// An edited copy has no sidecar of its own and shares the original's.
const EDITED_SUFFIXES: &[&str] = &[
    "-edited",      // EN
    "-effects",     // EN
    "-smile",       // EN
    "-mix",         // EN
    "-edytowane",   // PL
    "-bearbeitet",  // DE
    "-bewerkt",     // NL
    "-編集済み",     // JA
    "-modificato",  // IT
    "-modifié",     // FR
    "-ha editado",  // ES
    "-editat",      // CA
];

/// NFC form of a filename. macOS hands out decomposed names, sidecar titles
/// are usually composed.
pub fn nfc(name: &str) -> String {
    name.nfc().collect()
}

/// Name of the original a derivative was made from
/// (`IMG_1-edited.jpg` -> `IMG_1.jpg`), or the NFC name unchanged.
pub fn strip_edited_suffix(filename: &str) -> String {
    let normalized = nfc(filename);
    let lower = normalized.to_lowercase();
    // byte offsets in `lower` only map back when lowercasing kept lengths
    if lower.len() != normalized.len() {
        return normalized;
    }
    for suffix in EDITED_SUFFIXES {
        if let Some(pos) = lower.rfind(suffix) {
            let mut result = normalized.clone();
            result.replace_range(pos..pos + suffix.len(), "");
            return result;
        }
    }
    normalized
}
