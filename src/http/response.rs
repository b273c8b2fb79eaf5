use std::collections::HashMap;
use std::time::SystemTime;

use crate::http::mime;
use crate::http::status;

pub const SERVER_SOFTWARE: &str = "webserv/1.0";

/// An HTTP response under construction.
///
/// Header names are matched case-insensitively; setting a header replaces any
/// previous value regardless of case.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    sent: bool,
}

impl Default for Response {
    fn default() -> Self {
        Response::new(status::OK)
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        let mut response = Response {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
            sent: false,
        };
        response.set_body(Vec::new());
        response
    }

    pub fn html(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let mut response = Response::new(status);
        response.set_header("Content-Type", mime::TEXT_HTML);
        response.set_body(body);
        response
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &'static str {
        status::reason_phrase(self.status)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Replaces the body and derives `Content-Length` from it.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        let len = self.body.len().to_string();
        self.set_header("Content-Length", len);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    /// Serializes the response. `HTTP/1.0` requests get an `HTTP/1.0` status
    /// line, everything else `HTTP/1.1`. The connection is always closed.
    pub fn to_bytes(&self, request_version: &str) -> Vec<u8> {
        let version = if request_version == "HTTP/1.0" {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        };
        let mut head = format!("{} {} {}\r\n", version, self.status, self.reason());
        head.push_str(&format!("Server: {}\r\n", SERVER_SOFTWARE));
        head.push_str(&format!(
            "Date: {}\r\n",
            httpdate::fmt_http_date(SystemTime::now())
        ));
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case("Connection")
                || key.eq_ignore_ascii_case("Server")
                || key.eq_ignore_ascii_case("Date")
            {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", key, value));
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}
