//! Tests for running CGI scripts end to end

mod common;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use webserv::cgi::{self, CgiContext, CgiError, CgiJob, CgiOutcome};
use webserv::pages::ErrorPages;

const TIMEOUT: Duration = Duration::from_secs(10);

fn job(script: &Path, root: &Path) -> CgiJob {
    CgiJob {
        script: script.to_str().unwrap().to_string(),
        // Interpreted, so the freshly written file is never exec'd directly.
        interpreter: Some("/bin/sh".to_string()),
        document_root: root.to_str().unwrap().to_string(),
        script_name: "/cgi-bin/test.sh".to_string(),
        path_info: None,
    }
}

fn context() -> CgiContext {
    CgiContext {
        server_name: "localhost".to_string(),
        server_port: 8080,
        remote_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

fn run(script_body: &str, raw_request: &str) -> (Result<CgiOutcome, CgiError>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_script(dir.path(), "cgi-bin/test.sh", script_body);
    let request = common::request(raw_request);
    let result = cgi::execute(&job(&script, dir.path()), &request, &context(), TIMEOUT);
    (result, dir)
}

fn status_of(result: Result<CgiOutcome, CgiError>) -> u16 {
    let pages = HashMap::new();
    cgi::respond(result, &ErrorPages::new("/nonexistent", &pages)).status()
}

#[test]
fn test_script_sees_request_and_body() {
    let script = "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf '%s|%s|%s|%s|%s|' \"$REQUEST_METHOD\" \"$QUERY_STRING\" \"$HTTP_X_TOKEN\" \"$CONTENT_LENGTH\" \"$GATEWAY_INTERFACE\"\ncat\n";
    let raw = "POST /cgi-bin/test.sh?a=1 HTTP/1.1\r\nHost: localhost\r\nX-Token: t1\r\nContent-Length: 5\r\n\r\nhello";
    let (result, _dir) = run(script, raw);

    match result {
        Ok(CgiOutcome::Completed(output)) => {
            assert_eq!(output.status, 200);
            assert_eq!(
                String::from_utf8_lossy(&output.body),
                "POST|a=1|t1|5|CGI/1.1|hello"
            );
            let response = output.into_response();
            assert_eq!(response.header("Content-Type"), Some("text/plain"));
            assert_eq!(response.header("Content-Length"), Some("27"));
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_environment_is_not_inherited() {
    let script = "#!/bin/sh\necho 'Content-Type: text/plain'\necho\necho \"[$HOME][$PATH][$SCRIPT_NAME][$DOCUMENT_ROOT]\"\n";
    let (result, dir) = run(script, "GET /cgi-bin/test.sh HTTP/1.1\r\n\r\n");

    match result {
        Ok(CgiOutcome::Completed(output)) => {
            let expected = format!(
                "[][{}][/cgi-bin/test.sh][{}]\n",
                cgi::SAFE_PATH,
                dir.path().display()
            );
            assert_eq!(String::from_utf8_lossy(&output.body), expected);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_status_header_sets_response_status() {
    let script = "#!/bin/sh\nprintf 'Status: 404 Not Found\\r\\nX-Extra: 1\\r\\n\\r\\nnope'\n";
    let (result, _dir) = run(script, "GET /cgi-bin/test.sh HTTP/1.1\r\n\r\n");

    let response = match result {
        Ok(CgiOutcome::Completed(output)) => output.into_response(),
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(response.status(), 404);
    assert_eq!(response.header("X-Extra"), Some("1"));
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    assert_eq!(response.body(), b"nope");
}

#[test]
fn test_malformed_output_is_500() {
    let script = "#!/bin/sh\nprintf 'no colon here\\r\\n\\r\\nbody'\n";
    let (result, _dir) = run(script, "GET /cgi-bin/test.sh HTTP/1.1\r\n\r\n");
    assert!(matches!(result, Err(CgiError::MalformedOutput(_))));
    assert_eq!(status_of(result), 500);
}

#[test]
fn test_empty_output_is_502() {
    let (result, _dir) = run("#!/bin/sh\nexit 0\n", "GET /cgi-bin/test.sh HTTP/1.1\r\n\r\n");
    assert!(matches!(result, Err(CgiError::EmptyOutput)));
    assert_eq!(status_of(result), 502);
}

#[test]
fn test_missing_interpreter_is_502() {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_script(dir.path(), "run.sh", "#!/bin/sh\necho\n");
    let mut job = job(&script, dir.path());
    job.interpreter = Some("/nonexistent/interpreter".to_string());

    let request = common::request("GET /run.sh HTTP/1.1\r\n\r\n");
    let result = cgi::execute(&job, &request, &context(), TIMEOUT);
    assert!(matches!(result, Err(CgiError::Spawn { .. })));
    assert_eq!(status_of(result), 502);
}

#[test]
fn test_invalid_script_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_file(dir.path(), "plain.sh", b"#!/bin/sh\necho\n");
    let request = common::request("GET /plain.sh HTTP/1.1\r\n\r\n");

    let result = cgi::execute(&job(&script, dir.path()), &request, &context(), TIMEOUT);
    assert!(matches!(result, Err(CgiError::InvalidScript(_))));
    assert_eq!(status_of(result), 500);
}
