use std::collections::BTreeMap;

use crate::auth::basic_credentials;
use crate::http::response::SERVER_SOFTWARE;
use crate::http::Request;

use super::{CgiContext, CgiJob};

pub const GATEWAY_INTERFACE: &str = "CGI/1.1";
pub const SAFE_PATH: &str = "/usr/bin:/bin:/usr/local/bin";

// Carried by dedicated meta-variables, or never forwarded.
const UNFORWARDED: &[&str] = &["content-type", "content-length", "authorization", "proxy"];

/// Builds the complete environment of a CGI subprocess. Nothing is inherited
/// from the server process except a validated `TZ`.
pub fn environment(job: &CgiJob, request: &Request, context: &CgiContext) -> Vec<(String, String)> {
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set("PATH", SAFE_PATH.to_string());
    if let Ok(tz) = std::env::var("TZ") {
        if tz.len() < 100 && !tz.contains("..") {
            set("TZ", tz);
        }
    }
    set("IFS", " \t\n".to_string());
    set("LD_PRELOAD", String::new());
    set("LD_LIBRARY_PATH", String::new());

    set("GATEWAY_INTERFACE", GATEWAY_INTERFACE.to_string());
    set("SERVER_SOFTWARE", SERVER_SOFTWARE.to_string());
    set("SERVER_NAME", context.server_name.clone());
    set("SERVER_PORT", context.server_port.to_string());
    let protocol = if request.version().is_empty() {
        "HTTP/1.1"
    } else {
        request.version()
    };
    set("SERVER_PROTOCOL", protocol.to_string());

    set("REQUEST_METHOD", request.method().to_string());
    set("SCRIPT_NAME", job.script_name.clone());
    set("SCRIPT_FILENAME", job.script.clone());
    set("QUERY_STRING", request.query_string().to_string());
    let request_uri = if request.query_string().is_empty() {
        request.uri().to_string()
    } else {
        format!("{}?{}", request.uri(), request.query_string())
    };
    set("REQUEST_URI", request_uri);
    set("REMOTE_ADDR", context.remote_addr.to_string());
    set("REMOTE_HOST", context.remote_addr.to_string());
    set("DOCUMENT_ROOT", job.document_root.clone());

    if let Some(path_info) = &job.path_info {
        set("PATH_INFO", path_info.clone());
        set(
            "PATH_TRANSLATED",
            format!(
                "{}/{}",
                job.document_root.trim_end_matches('/'),
                path_info.trim_start_matches('/')
            ),
        );
    }

    if let Some(content_type) = request.header("content-type") {
        set("CONTENT_TYPE", content_type.to_string());
    }
    if !request.body().is_empty() || request.header("content-length").is_some() {
        set("CONTENT_LENGTH", request.body().len().to_string());
    }

    if let Some((user, _)) = request.header("authorization").and_then(basic_credentials) {
        set("AUTH_TYPE", "Basic".to_string());
        set("REMOTE_USER", user);
    }

    for (name, value) in request.headers() {
        if UNFORWARDED.contains(&name.as_str()) {
            continue;
        }
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        set(&key, value.clone());
    }

    env.into_iter().collect()
}
