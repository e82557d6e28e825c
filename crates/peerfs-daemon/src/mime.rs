//! MIME type by file extension
//!
//! Media types the thumbnail engine cares about come first; a short tail
//! of common document types keeps listings useful. Unknown extensions
//! yield an empty string on the wire.

/// Well-known content types, matched case-insensitively on the extension.
const CONTENT_TYPES: &[(&str, &str)] = &[
    // video
    (".mp4", "video/mp4"),
    (".m4v", "video/mp4"),
    (".f4v", "video/mp4"),
    (".mov", "video/mp4"),
    (".webm", "video/webm"),
    (".ogv", "video/ogv"),
    // image
    (".jpeg", "image/jpeg"),
    (".jpg", "image/jpeg"),
    (".gif", "image/gif"),
    (".png", "image/png"),
    (".bmp", "image/bmp"),
    (".webp", "image/webp"),
    // audio
    (".aac", "audio/aac"),
    (".mp3", "audio/mp3"),
    (".ogg", "audio/ogg"),
    (".mid", "audio/midi"),
    // documents
    (".txt", "text/plain"),
    (".md", "text/plain"),
    (".html", "text/html"),
    (".htm", "text/html"),
    (".css", "text/css"),
    (".js", "text/javascript"),
    (".json", "application/json"),
    (".pdf", "application/pdf"),
    (".zip", "application/zip"),
];

/// Content type of a path by its extension; empty when unknown.
pub fn content_type_by_path(path: &str) -> String {
    let ext = match path.rfind('.') {
        Some(i) => path[i..].to_ascii_lowercase(),
        None => return String::new(),
    };
    CONTENT_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, t)| t.to_string())
        .unwrap_or_default()
}
