//! Filename -> mime type mapping and binary-extension classification.
//!
//! Both tables are deliberately enumerated rather than pulled from a
//! platform registry so peers classify files identically.

/// Known extension -> mime type table.
const MIME_TYPES: &[(&str, &str)] = &[
    // Text
    ("md", "text/markdown"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("html", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("toml", "application/toml"),
    // Images
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("bmp", "image/bmp"),
    ("ico", "image/x-icon"),
    ("heic", "image/heic"),
    ("avif", "image/avif"),
    // Audio
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("flac", "audio/flac"),
    ("m4a", "audio/mp4"),
    // Video
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mov", "video/quicktime"),
    ("mkv", "video/x-matroska"),
    // Documents
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("7z", "application/x-7z-compressed"),
    // Fonts
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
];

/// Extensions treated as binary content (stored as blobs, not CRDT text).
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "ico", "heic", "avif",
    "mp3", "wav", "ogg", "flac", "m4a",
    "mp4", "webm", "mov", "mkv",
    "pdf", "zip", "gz", "tar", "7z",
    "ttf", "otf", "woff", "woff2",
    "bin", "exe", "dll", "so", "dylib", "wasm",
    "db", "sqlite",
];

/// Lowercased extension of a filename or path, if any.
fn extension(name: &str) -> Option<String> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let dot = base.rfind('.')?;
    if dot == 0 || dot + 1 == base.len() {
        // Dotfiles and trailing dots have no extension
        return None;
    }
    Some(base[dot + 1..].to_ascii_lowercase())
}

/// Mime type for a filename or path. Unknown extensions get
/// `application/octet-stream`.
pub fn mime_type_for(name: &str) -> &'static str {
    if let Some(ext) = extension(name) {
        for (e, mime) in MIME_TYPES {
            if *e == ext {
                return mime;
            }
        }
    }
    "application/octet-stream"
}

/// Whether a filename or path should be stored as a binary blob.
pub fn is_binary_path(name: &str) -> bool {
    match extension(name) {
        Some(ext) => BINARY_EXTENSIONS.iter().any(|e| *e == ext),
        None => false,
    }
}
