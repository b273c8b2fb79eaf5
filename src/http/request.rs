//! Incremental HTTP request decoder.
//!
//! A [`Request`] is fed raw bytes as they arrive on the socket. It parses the
//! head once the blank line is seen, then collects a fixed-length or chunked
//! body. Once complete (or failed) further input is ignored.

use std::collections::HashMap;

use tracing::debug;

/// Upper bound for the request line plus headers.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;
/// Upper bound for a single chunk of a chunked body.
pub const MAX_CHUNK_SIZE: usize = 50 * 1024 * 1024;
/// Body limit applied to chunked bodies when no limit is installed.
pub const MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    HeaderTooLarge,
    EntityTooLarge,
}

impl ParseError {
    /// Sentinel name of the error, as reported in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseError::HeaderTooLarge => "ERROR_HEADER_TOO_LARGE",
            ParseError::EntityTooLarge => "ERROR_REQUEST_ENTITY_TOO_LARGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    FixedBody,
    Chunked(Chunk),
    Complete,
    Failed(ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(usize),
    AfterLast,
    Trailers,
}

enum Step {
    Continue,
    NeedMore,
}

#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    uri: String,
    query_string: String,
    version: String,
    headers: HashMap<String, String>,
    trailers: HashMap<String, String>,
    body: Vec<u8>,
    buffer: Vec<u8>,
    content_length: usize,
    chunked: bool,
    max_body_size: Option<usize>,
    received_any: bool,
    state: State,
}

impl Default for Request {
    fn default() -> Self {
        Request::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Request {
            method: String::new(),
            uri: String::new(),
            query_string: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            trailers: HashMap::new(),
            body: Vec::new(),
            buffer: Vec::new(),
            content_length: 0,
            chunked: false,
            max_body_size: None,
            received_any: false,
            state: State::Head,
        }
    }

    /// Installs the body size limit. A limit of 0 means "no configured
    /// limit"; chunked bodies are then bounded by [`MAX_BODY_SIZE`].
    pub fn set_max_body_size(&mut self, limit: usize) {
        self.max_body_size = Some(limit);
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.feed_with(data, |_| None)
    }

    /// Like [`feed`](Self::feed), but asks `limit_for` for the body limit
    /// as soon as the head is parsed, unless one was installed already.
    pub fn feed_with<F>(&mut self, data: &[u8], limit_for: F)
    where
        F: FnOnce(&Request) -> Option<usize>,
    {
        if self.is_complete() {
            return;
        }
        if !data.is_empty() {
            self.received_any = true;
        }
        self.buffer.extend_from_slice(data);

        if self.state == State::Head {
            if !self.parse_head() {
                return;
            }
            if self.max_body_size.is_none() {
                self.max_body_size = limit_for(self);
            }
            self.begin_body();
        }

        match self.state {
            State::FixedBody => self.take_fixed_body(),
            State::Chunked(_) => self.take_chunks(),
            _ => {}
        }
    }

    /// Returns `true` once the head was parsed.
    fn parse_head(&mut self) -> bool {
        let (head_end, sep_len) = match find(&self.buffer, b"\r\n\r\n")
            .map(|pos| (pos, 4))
            .or_else(|| find(&self.buffer, b"\n\n").map(|pos| (pos, 2)))
        {
            Some(found) => found,
            None => {
                // The last three bytes may be the start of a split separator.
                if self.buffer.len() > MAX_HEADER_SIZE + 3 {
                    self.fail(ParseError::HeaderTooLarge);
                }
                return false;
            }
        };
        if head_end > MAX_HEADER_SIZE {
            self.fail(ParseError::HeaderTooLarge);
            return false;
        }

        let head = String::from_utf8_lossy(&self.buffer[..head_end]).into_owned();
        self.buffer.drain(..head_end + sep_len);

        let mut lines = head.lines();
        if let Some(line) = lines.next() {
            self.parse_request_line(line);
        }
        for line in lines {
            if let Some((name, value)) = split_header(line) {
                self.headers.insert(name, value);
            }
        }

        self.chunked = self
            .header("transfer-encoding")
            .map_or(false, |v| v.eq_ignore_ascii_case("chunked"));
        self.content_length = self
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        debug!(
            method = %self.method,
            uri = %self.uri,
            chunked = self.chunked,
            content_length = self.content_length,
            "request head parsed"
        );
        true
    }

    fn parse_request_line(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        if let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        {
            self.method = method.to_string();
            self.version = version.to_string();
            match target.split_once('?') {
                Some((path, query)) => {
                    self.uri = path.to_string();
                    self.query_string = query.to_string();
                }
                None => self.uri = target.to_string(),
            }
        }
    }

    fn begin_body(&mut self) {
        if self.chunked {
            self.state = State::Chunked(Chunk::Size);
            return;
        }
        let limit = self.max_body_size.unwrap_or(0);
        if limit > 0 && self.content_length > limit {
            self.fail(ParseError::EntityTooLarge);
            return;
        }
        self.state = State::FixedBody;
    }

    fn take_fixed_body(&mut self) {
        let missing = self.content_length - self.body.len();
        let take = missing.min(self.buffer.len());
        self.body.extend(self.buffer.drain(..take));
        if self.body.len() == self.content_length {
            self.buffer.clear();
            self.state = State::Complete;
        }
    }

    fn take_chunks(&mut self) {
        while let State::Chunked(chunk) = self.state {
            let step = match chunk {
                Chunk::Size => self.chunk_size(),
                Chunk::Data(size) => self.chunk_data(size),
                Chunk::AfterLast => self.after_last_chunk(),
                Chunk::Trailers => self.trailer_line(),
            };
            if let Step::NeedMore = step {
                return;
            }
        }
    }

    fn chunk_size(&mut self) -> Step {
        let line = match self.take_line() {
            Some(line) => line,
            None => return Step::NeedMore,
        };
        let hex = line.split(';').next().unwrap_or("").trim();
        // An unparsable size line counts as the terminating chunk.
        let size = usize::from_str_radix(hex, 16).unwrap_or(0);

        let limit = match self.max_body_size {
            Some(limit) if limit > 0 => limit,
            _ => MAX_BODY_SIZE,
        };
        if size > MAX_CHUNK_SIZE || self.body.len().saturating_add(size) > limit {
            self.fail(ParseError::EntityTooLarge);
            return Step::Continue;
        }

        self.state = if size == 0 {
            State::Chunked(Chunk::AfterLast)
        } else {
            State::Chunked(Chunk::Data(size))
        };
        Step::Continue
    }

    fn chunk_data(&mut self, size: usize) -> Step {
        if self.buffer.len() < size + 2 {
            return Step::NeedMore;
        }
        self.body.extend_from_slice(&self.buffer[..size]);
        self.buffer.drain(..size + 2);
        self.state = State::Chunked(Chunk::Size);
        Step::Continue
    }

    fn after_last_chunk(&mut self) -> Step {
        match find(&self.buffer, b"\r\n") {
            None => Step::NeedMore,
            Some(0) => {
                self.buffer.drain(..2);
                self.complete();
                Step::Continue
            }
            Some(_) => {
                self.state = State::Chunked(Chunk::Trailers);
                Step::Continue
            }
        }
    }

    fn trailer_line(&mut self) -> Step {
        let line = match self.take_line() {
            Some(line) => line,
            None => return Step::NeedMore,
        };
        if line.is_empty() {
            self.complete();
        } else if let Some((name, value)) = split_header(&line) {
            self.trailers.insert(name, value);
        }
        Step::Continue
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = find(&self.buffer, b"\r\n")?;
        let line = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
        self.buffer.drain(..pos + 2);
        Some(line)
    }

    fn complete(&mut self) {
        self.buffer.clear();
        self.state = State::Complete;
    }

    fn fail(&mut self, error: ParseError) {
        debug!(error = error.as_str(), "request rejected");
        self.buffer.clear();
        self.state = State::Failed(error);
    }

    /// `true` once the request is complete or has failed.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete | State::Failed(_))
    }

    pub fn has_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn error(&self) -> Option<ParseError> {
        match self.state {
            State::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Whether any bytes of this request arrived yet.
    pub fn in_progress(&self) -> bool {
        self.received_any && !self.is_complete()
    }

    pub fn headers_parsed(&self) -> bool {
        !matches!(self.state, State::Head | State::Failed(ParseError::HeaderTooLarge))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Headers keyed by lower-cased name.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn trailers(&self) -> &HashMap<String, String> {
        &self.trailers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn max_body_size(&self) -> Option<usize> {
        self.max_body_size
    }
}

fn split_header(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((
        name.to_ascii_lowercase(),
        value.trim().trim_end_matches('\r').to_string(),
    ))
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
