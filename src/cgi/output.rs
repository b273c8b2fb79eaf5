use crate::http::mime;
use crate::http::request::find;
use crate::http::status;
use crate::http::Response;

use super::CgiError;

/// Script output split into status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiOutput {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub fn parse_output(raw: &[u8]) -> Result<CgiOutput, CgiError> {
    let split = find(raw, b"\r\n\r\n")
        .map(|pos| (pos, 4))
        .or_else(|| find(raw, b"\n\n").map(|pos| (pos, 2)));

    let (head, body) = match split {
        Some((pos, len)) => (&raw[..pos], &raw[pos + len..]),
        None => {
            return Ok(CgiOutput {
                status: status::OK,
                headers: vec![("Content-Type".to_string(), mime::TEXT_HTML.to_string())],
                body: raw.to_vec(),
            })
        }
    };

    let mut output = CgiOutput {
        status: status::OK,
        headers: Vec::new(),
        body: body.to_vec(),
    };
    for line in String::from_utf8_lossy(head).lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CgiError::MalformedOutput(line.to_string()))?;
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("Status") {
            output.status = value
                .get(..3)
                .and_then(|code| code.parse().ok())
                .filter(|code| (100..=599).contains(code))
                .unwrap_or(status::OK);
            continue;
        }
        output.headers.push((name.to_string(), value.to_string()));
    }

    if !output
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("Content-Type"))
    {
        output
            .headers
            .push(("Content-Type".to_string(), mime::TEXT_HTML.to_string()));
    }
    Ok(output)
}

impl CgiOutput {
    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.status);
        for (name, value) in &self.headers {
            response.set_header(name, value.as_str());
        }
        // Content-Length always reflects the body actually sent.
        response.set_body(self.body);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_headers_from_body() {
        let output = parse_output(b"Content-Type: text/plain\r\nX-Id: 7\r\n\r\nhello\r\n\r\nworld").unwrap();
        assert_eq!(output.status, 200);
        assert_eq!(
            output.headers,
            vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("X-Id".to_string(), "7".to_string()),
            ]
        );
        assert_eq!(output.body, b"hello\r\n\r\nworld");
    }

    #[test]
    fn status_header_sets_code() {
        let output = parse_output(b"Status: 404 Not Found\nContent-Type: text/plain\n\nnope").unwrap();
        assert_eq!(output.status, 404);
        assert!(output.headers.iter().all(|(name, _)| name != "Status"));

        let response = output.into_response();
        assert_eq!(response.status(), 404);
        assert_eq!(response.header("Content-Length"), Some("4"));
    }

    #[test]
    fn out_of_range_status_defaults_to_ok() {
        assert_eq!(parse_output(b"Status: 999\r\n\r\n").unwrap().status, 200);
        assert_eq!(parse_output(b"Status: abc\r\n\r\n").unwrap().status, 200);
    }

    #[test]
    fn output_without_separator_is_body() {
        let output = parse_output(b"just text").unwrap();
        assert_eq!(output.body, b"just text");
        assert_eq!(output.headers[0].1, "text/html");
    }

    #[test]
    fn header_without_colon_is_malformed() {
        let err = parse_output(b"Content-Type: text/plain\r\nbroken line\r\n\r\nbody").unwrap_err();
        assert!(matches!(err, CgiError::MalformedOutput(line) if line == "broken line"));
    }
}
