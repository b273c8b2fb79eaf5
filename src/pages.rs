//! Generated HTML: error pages and directory listings.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

use crate::config::Server;
use crate::http::status::{description, reason_phrase};
use crate::http::Response;

/// Error page lookup for one server: the configured page for the status
/// code, then a `4xx.html`/`5xx.html` template under the root, then a
/// generated page.
pub struct ErrorPages<'a> {
    root: &'a str,
    pages: &'a HashMap<u16, String>,
}

impl<'a> ErrorPages<'a> {
    pub fn new(root: &'a str, pages: &'a HashMap<u16, String>) -> Self {
        ErrorPages { root, pages }
    }

    pub fn for_server(server: &'a Server) -> Self {
        ErrorPages::new(&server.root, &server.error_pages)
    }

    pub fn response(&self, code: u16) -> Response {
        Response::html(code, self.render(code))
    }

    pub fn render(&self, code: u16) -> Vec<u8> {
        if let Some(page) = self.custom(code) {
            return page;
        }
        if let Some(page) = self.template(code) {
            return page.into_bytes();
        }
        default_page(code).into_bytes()
    }

    fn custom(&self, code: u16) -> Option<Vec<u8>> {
        let path = self.pages.get(&code)?;
        let full = join(self.root, path);
        match fs::read(&full) {
            Ok(content) => Some(content),
            Err(err) => {
                warn!(code, path = %full, error = %err, "custom error page unreadable");
                None
            }
        }
    }

    fn template(&self, code: u16) -> Option<String> {
        let name = match code / 100 {
            4 => "4xx.html",
            5 => "5xx.html",
            _ => return None,
        };
        let content = fs::read_to_string(join(self.root, name)).ok()?;
        if content.is_empty() {
            return None;
        }
        Some(
            content
                .replace("{{ERROR_CODE}}", &code.to_string())
                .replace("{{ERROR_MESSAGE}}", reason_phrase(code))
                .replace("{{ERROR_DESCRIPTION}}", description(code)),
        )
    }
}

pub fn default_page(code: u16) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{code} {reason}</title>
    <style>
        body {{ font-family: sans-serif; background: #f5f5f5; margin: 0; padding: 60px; text-align: center; }}
        h1 {{ color: #e74c3c; font-size: 72px; margin: 0; }}
        p {{ color: #666; font-size: 18px; }}
    </style>
</head>
<body>
    <h1>{code}</h1>
    <p>{reason}</p>
    <p>{description}</p>
    <a href="/">Go Home</a>
</body>
</html>
"#,
        code = code,
        reason = reason_phrase(code),
        description = description(code),
    )
}

pub fn redirect_page(code: u16, target: &str) -> String {
    format!(
        "<html><body><h1>{} {}</h1><p>The document has moved <a href=\"{}\">here</a>.</p></body></html>",
        code,
        reason_phrase(code),
        escape(target)
    )
}

pub fn directory_listing(dir: &Path, uri: &str) -> io::Result<String> {
    let mut entries = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            Some((entry.file_name().to_string_lossy().into_owned(), meta))
        })
        .collect::<Vec<_>>();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let base = if uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{}/", uri)
    };
    let mut rows = String::new();
    for (name, meta) in entries {
        let suffix = if meta.is_dir() { "/" } else { "" };
        let size = if meta.is_dir() {
            "-".to_string()
        } else {
            format!("{} bytes", meta.len())
        };
        let modified = meta
            .modified()
            .map(httpdate::fmt_http_date)
            .unwrap_or_default();
        rows.push_str(&format!(
            "<tr><td><a href=\"{href}{suffix}\">{name}{suffix}</a></td><td>{size}</td><td>{modified}</td></tr>\n",
            href = escape(&format!("{}{}", base, name)),
            name = escape(&name),
            suffix = suffix,
            size = size,
            modified = modified,
        ));
    }

    Ok(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {uri}</title></head>\n<body>\n<h1>Index of {uri}</h1>\n<table>\n<tr><th>Name</th><th>Size</th><th>Last Modified</th></tr>\n{rows}</table>\n</body>\n</html>\n",
        uri = escape(uri),
        rows = rows
    ))
}

fn join(root: &str, path: &str) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
