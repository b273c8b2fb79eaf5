//! Tests for the incremental request decoder

mod common;

use webserv::http::request::MAX_HEADER_SIZE;
use webserv::http::{ParseError, Request};

fn post(body: &[u8]) -> Vec<u8> {
    let mut raw = format!(
        "POST /submit HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(body);
    raw
}

#[test]
fn test_split_does_not_change_result() {
    let bodies: [&[u8]; 4] = [b"", b"x", b"hello world", &[0u8, 13, 10, 13, 10, 255]];
    for body in bodies {
        let raw = post(body);

        let mut whole = Request::new();
        whole.feed(&raw);

        let mut bytewise = Request::new();
        for byte in &raw {
            bytewise.feed(std::slice::from_ref(byte));
        }

        let mut halves = Request::new();
        let (a, b) = raw.split_at(raw.len() / 2);
        halves.feed(a);
        halves.feed(b);

        for req in [&whole, &bytewise, &halves] {
            assert!(req.is_complete());
            assert!(!req.has_error());
            assert_eq!(req.body(), body);
            assert_eq!(req.uri(), "/submit");
        }
    }
}

#[test]
fn test_chunked_round_trip() {
    let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let cases: [&[usize]; 4] = [&[1], &[7, 300], &[4096], &[body.len()]];
    for sizes in cases {
        let mut raw = b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend(common::chunked(&body, sizes));

        let mut req = Request::new();
        for piece in raw.chunks(13) {
            req.feed(piece);
        }
        assert!(req.is_complete());
        assert!(req.is_chunked());
        assert_eq!(req.body(), &body[..]);
    }
}

#[test]
fn test_content_length_over_limit_fails_before_body() {
    let mut req = Request::new();
    req.set_max_body_size(10);
    req.feed(b"POST / HTTP/1.1\r\nContent-Length: 1000\r\n\r\n");
    assert!(req.is_complete());
    assert_eq!(req.error(), Some(ParseError::EntityTooLarge));
    assert_eq!(req.error().unwrap().as_str(), "ERROR_REQUEST_ENTITY_TOO_LARGE");

    // Nothing changes once failed.
    req.feed(b"0123456789");
    assert!(req.body().is_empty());
}

#[test]
fn test_chunked_body_over_limit() {
    let mut req = Request::new();
    req.set_max_body_size(8);
    let mut raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    raw.extend(common::chunked(b"0123456789", &[5]));
    req.feed(&raw);
    assert_eq!(req.error(), Some(ParseError::EntityTooLarge));
}

#[test]
fn test_header_without_terminator_over_limit() {
    let mut req = Request::new();
    req.feed(b"GET / HTTP/1.1\r\n");
    assert!(req.in_progress());
    req.feed(&vec![b'a'; MAX_HEADER_SIZE]);
    assert_eq!(req.error(), Some(ParseError::HeaderTooLarge));
    assert!(!req.headers_parsed());
}

#[test]
fn test_largest_head_accepted_whatever_the_split() {
    let mut raw = b"GET /big HTTP/1.1\r\nX-Pad: ".to_vec();
    raw.resize(MAX_HEADER_SIZE - 1, b'p');
    raw.extend_from_slice(b"\r\n\r\n");

    let mut whole = Request::new();
    whole.feed(&raw);

    let mut split = Request::new();
    let (a, b) = raw.split_at(MAX_HEADER_SIZE + 1);
    split.feed(a);
    split.feed(b);

    assert_eq!(whole.error(), None);
    assert_eq!(split.error(), whole.error());
    assert!(split.is_complete());
    assert_eq!(split.uri(), "/big");

    // Two more bytes of head and it is rejected.
    raw.insert(30, b'p');
    raw.insert(30, b'p');
    let mut over = Request::new();
    over.feed(&raw[..MAX_HEADER_SIZE + 1]);
    over.feed(&raw[MAX_HEADER_SIZE + 1..]);
    assert_eq!(over.error(), Some(ParseError::HeaderTooLarge));
}

#[test]
fn test_zero_length_completes_immediately() {
    let req = common::request("DELETE /file.txt HTTP/1.1\r\nHost: a\r\n\r\n");
    assert_eq!(req.method(), "DELETE");
    assert_eq!(req.content_length(), 0);
    assert!(!req.in_progress());
}
