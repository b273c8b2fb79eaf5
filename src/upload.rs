//! `multipart/form-data` file uploads.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::http::request::find;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("missing multipart boundary")]
    MissingBoundary,
    #[error("malformed multipart body")]
    Malformed,
    #[error("invalid file name {0:?}")]
    InvalidFilename(String),
    #[error("no file part in upload")]
    NoFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub filename: String,
    pub data: Vec<u8>,
}

pub fn is_multipart(content_type: Option<&str>) -> bool {
    content_type.map_or(false, |ct| {
        ct.to_ascii_lowercase().starts_with("multipart/form-data")
    })
}

/// Extracts every part carrying a `filename`. Other form fields are skipped.
pub fn parse(content_type: &str, body: &[u8]) -> Result<Vec<FilePart>, UploadError> {
    let boundary = boundary(content_type).ok_or(UploadError::MissingBoundary)?;
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut closing = b"\r\n".to_vec();
    closing.extend_from_slice(&delimiter);

    let mut rest = match find(body, &delimiter) {
        Some(pos) => &body[pos + delimiter.len()..],
        None => return Err(UploadError::Malformed),
    };

    let mut files = Vec::new();
    loop {
        if rest.starts_with(b"--") {
            break;
        }
        rest = rest.strip_prefix(b"\r\n").ok_or(UploadError::Malformed)?;
        let head_end = find(rest, b"\r\n\r\n").ok_or(UploadError::Malformed)?;
        let head = String::from_utf8_lossy(&rest[..head_end]).into_owned();
        rest = &rest[head_end + 4..];

        let data_end = find(rest, &closing).ok_or(UploadError::Malformed)?;
        let data = &rest[..data_end];
        rest = &rest[data_end + closing.len()..];

        if let Some(filename) = disposition_filename(&head) {
            files.push(FilePart {
                filename: sanitize(&filename)?,
                data: data.to_vec(),
            });
        }
    }

    if files.is_empty() {
        return Err(UploadError::NoFile);
    }
    Ok(files)
}

/// Writes the parts into `dir`, returning the number of bytes stored.
pub fn store(dir: &Path, files: &[FilePart]) -> io::Result<usize> {
    let mut total = 0;
    for file in files {
        fs::write(dir.join(&file.filename), &file.data)?;
        total += file.data.len();
    }
    Ok(total)
}

fn boundary(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("boundary") {
                Some(value.trim().trim_matches('"'))
            } else {
                None
            }
        })
        .filter(|b| !b.is_empty())
}

fn disposition_filename(head: &str) -> Option<String> {
    let line = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-disposition:"))?;
    let start = line.find("filename=\"")? + "filename=\"".len();
    let end = line[start..].find('"')? + start;
    Some(line[start..end].to_string())
}

fn sanitize(filename: &str) -> Result<String, UploadError> {
    let name = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("");
    if name.is_empty() || name == "." || name == ".." || name.contains("..") {
        return Err(UploadError::InvalidFilename(filename.to_string()));
    }
    Ok(name.to_string())
}
