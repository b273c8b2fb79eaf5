use crate::config::extension;

pub const TEXT_HTML: &str = "text/html";
pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type for `path`, falling back to `application/octet-stream`.
pub fn from_path(path: &str) -> &'static str {
    let ext = match extension(path) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return OCTET_STREAM,
    };
    match ext.as_str() {
        ".html" | ".htm" => TEXT_HTML,
        ".css" => "text/css",
        ".js" => "application/javascript",
        ".json" => "application/json",
        ".txt" => TEXT_PLAIN,
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".ico" => "image/x-icon",
        ".pdf" => "application/pdf",
        ".xml" => "application/xml",
        ".mp4" => "video/mp4",
        ".avi" => "video/x-msvideo",
        ".mov" => "video/quicktime",
        ".wmv" => "video/x-ms-wmv",
        ".flv" => "video/x-flv",
        ".webm" => "video/webm",
        _ => OCTET_STREAM,
    }
}
