//! Extension to category mapping.
//!
//! The tables are the single source of truth for categorisation so that the
//! watcher, the startup sweep and user uploads can never disagree about what a
//! file is.

use std::path::Path;

use crate::types::Category;

pub const DOCUMENT_EXTENSIONS: &[&str] = &[
    "txt", "doc", "docx", "pdf", "ppt", "pptx", "xls", "xlsx", "csv", "ods", "odt", "rtf", "md",
];

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "svg", "webp", "tiff", "ico", "heic",
];

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v", "mpg", "mpeg",
];

pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "flac", "aac", "ogg", "wma"];

pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2", "xz"];

const TABLE: &[(Category, &[&str])] = &[
    (Category::Document, DOCUMENT_EXTENSIONS),
    (Category::Image, IMAGE_EXTENSIONS),
    (Category::Video, VIDEO_EXTENSIONS),
    (Category::Audio, AUDIO_EXTENSIONS),
    (Category::Archive, ARCHIVE_EXTENSIONS),
];

/// Classifies an extension. Case-insensitive, the leading dot is optional and
/// anything unknown (including the empty string) is `Other`.
pub fn classify(extension: &str) -> Category {
    let ext = extension.trim();
    let ext = ext.strip_prefix('.').unwrap_or(ext);
    if ext.is_empty() {
        return Category::Other;
    }

    TABLE
        .iter()
        .find(|(_, extensions)| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .map(|(category, _)| *category)
        .unwrap_or(Category::Other)
}

/// Classifies a file path by its extension. Does not stat; directories are
/// recognised by the caller.
pub fn classify_path(path: &Path) -> Category {
    classify(&extension_of(path))
}

/// Lower-cased extension with its leading dot, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}
