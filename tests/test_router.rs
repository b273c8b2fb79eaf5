//! Tests for location resolution and the handler chain

mod common;

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tempfile::TempDir;

use webserv::auth::{Authenticator, UserFile};
use webserv::config::{BasicAuth, Config};
use webserv::http::{Request, Response};
use webserv::router::{Outcome, Router};

/// Accepts or rejects everyone.
struct Fixed(bool);

impl Authenticator for Fixed {
    fn authenticate(&self, _: &BasicAuth, _: Option<&str>) -> bool {
        self.0
    }
}

struct Site {
    dir: TempDir,
    config: Config,
}

impl Site {
    fn new() -> Site {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();

        common::write_file(dir.path(), "index.html", b"home");
        common::write_file(dir.path(), "a/b/c.txt", b"abc");
        common::write_file(dir.path(), "a/readme.txt", b"readme");
        common::write_file(dir.path(), "media/x.png", b"\x89PNG");
        common::write_file(dir.path(), "files/f.txt", b"f");
        common::write_file(dir.path(), "users", b"# accounts\nadmin:secret\n");
        fs::create_dir_all(dir.path().join("private")).unwrap();
        common::write_script(dir.path(), "cgi-bin/run.sh", "#!/bin/sh\necho\n");

        let config = Config::parse(&format!(
            r#"
[[server]]
root = "{root}"
index = ["index.html"]
client_max_body_size = "1k"

[[server.location]]
route = "/"

[[server.location]]
route = "/a/b"
methods = ["GET", "DELETE"]

[[server.location]]
route = "/img"
alias = "{root}/media"

[[server.location]]
route = "/old"
methods = ["GET", "POST"]
return = {{ code = 302, target = "/new" }}

[[server.location]]
route = "/files"
autoindex = true
index = []
methods = ["GET", "POST", "DELETE"]

[[server.location]]
route = "/private"
methods = ["GET", "POST"]
auth_basic = "Secret"
auth_basic_user_file = "{root}/users"

[[server.location]]
route = "/cgi-bin"
methods = ["GET", "POST"]
cgi = {{ ".sh" = "" }}
"#
        ))
        .unwrap();
        Site { dir, config }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn route(&self, raw: &str) -> Outcome {
        self.route_with(raw, &UserFile)
    }

    fn route_with(&self, raw: &str, authenticator: &dyn Authenticator) -> Outcome {
        let request = common::request(raw);
        Router::new(&self.config.servers[0], authenticator).handle(&request)
    }

    fn respond(&self, raw: &str) -> Response {
        match self.route(raw) {
            Outcome::Respond(response) => response,
            Outcome::Gateway(job) => panic!("unexpected gateway job {:?}", job),
        }
    }
}

fn get(uri: &str) -> String {
    format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", uri)
}

fn multipart(uri: &str, filename: &str, content: &str, authorization: Option<&str>) -> String {
    let body = format!(
        "--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: text/plain\r\n\r\n{}\r\n--XyZ--\r\n",
        filename, content
    );
    let auth = authorization.map_or(String::new(), |a| format!("Authorization: {}\r\n", a));
    format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\n{}Content-Type: multipart/form-data; boundary=XyZ\r\nContent-Length: {}\r\n\r\n{}",
        uri,
        auth,
        body.len(),
        body
    )
}

#[test]
fn test_longest_prefix_wins() {
    let site = Site::new();
    let server = &site.config.servers[0];
    assert_eq!(server.location("/a/b/c.txt").unwrap().route, "/a/b");
    assert_eq!(server.location("/a/bc").unwrap().route, "/");
    assert_eq!(server.location("/a/readme.txt").unwrap().route, "/");

    // Only /a/b allows DELETE.
    let response = site.respond("DELETE /a/readme.txt HTTP/1.1\r\n\r\n");
    assert_eq!(response.status(), 405);
    assert!(site.root().join("a/readme.txt").exists());
}

#[test]
fn test_serves_index_and_static_files() {
    let site = Site::new();

    let response = site.respond(&get("/"));
    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), b"home");
    assert_eq!(response.header("Content-Type"), Some("text/html"));

    let response = site.respond(&get("/a/b/c.txt"));
    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), b"abc");
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
}

#[test]
fn test_alias_replaces_route() {
    let site = Site::new();
    let response = site.respond(&get("/img/x.png"));
    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), b"\x89PNG");
    assert_eq!(response.header("Content-Type"), Some("image/png"));
}

#[test]
fn test_redirect_precedes_method_check() {
    let site = Site::new();
    for raw in [get("/old/page"), "POST /old HTTP/1.1\r\nContent-Length: 0\r\n\r\n".to_string()] {
        let response = site.respond(&raw);
        assert_eq!(response.status(), 302);
        assert_eq!(response.header("Location"), Some("/new"));
    }
}

#[test]
fn test_method_not_allowed_lists_allowed_methods() {
    let site = Site::new();
    let response = site.respond("POST /index.html HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(response.status(), 405);
    assert_eq!(response.header("Allow"), Some("GET"));

    // Unsupported methods fail before any location is consulted.
    let response = site.respond("PUT /files/f.txt HTTP/1.1\r\n\r\n");
    assert_eq!(response.status(), 405);
    assert_eq!(response.header("Allow"), None);
}

#[test]
fn test_missing_file_and_bad_request() {
    let site = Site::new();
    assert_eq!(site.respond(&get("/missing.txt")).status(), 404);
    assert_eq!(site.respond(&get("/index.html/")).status(), 404);
    assert_eq!(site.respond("\r\n\r\n").status(), 400);
}

#[test]
fn test_parent_segments_are_forbidden() {
    let site = Site::new();
    assert_eq!(site.respond(&get("/a/../../etc/passwd")).status(), 403);
}

#[test]
fn test_directory_without_index() {
    let site = Site::new();
    // Autoindex off.
    assert_eq!(site.respond(&get("/a/")).status(), 403);

    let response = site.respond(&get("/files/"));
    assert_eq!(response.status(), 200);
    let listing = String::from_utf8_lossy(response.body()).into_owned();
    assert!(listing.contains("f.txt"));
    assert!(listing.contains("Index of /files/"));
}

#[test]
fn test_delete() {
    let site = Site::new();
    let raw = "DELETE /files/f.txt HTTP/1.1\r\n\r\n";
    assert_eq!(site.respond(raw).status(), 204);
    assert!(!site.root().join("files/f.txt").exists());
    assert_eq!(site.respond(raw).status(), 404);

    assert_eq!(site.respond("DELETE /files/ HTTP/1.1\r\n\r\n").status(), 403);
}

#[test]
fn test_upload_to_directory() {
    let site = Site::new();
    let response = site.respond(&multipart("/files/", "..", "hello", None));
    assert_eq!(response.status(), 400);

    let response = site.respond(&multipart("/files/", "notes.txt", "hello", None));
    assert_eq!(response.status(), 201);
    assert_eq!(fs::read(site.root().join("files/notes.txt")).unwrap(), b"hello");
}

#[test]
fn test_post_requires_credentials() {
    let site = Site::new();

    let response = site.respond(&multipart("/private/", "a.txt", "x", None));
    assert_eq!(response.status(), 401);
    assert_eq!(response.header("WWW-Authenticate"), Some("Basic realm=\"Secret\""));

    let wrong = format!("Basic {}", STANDARD.encode("admin:guess"));
    let response = site.respond(&multipart("/private/", "a.txt", "x", Some(&wrong)));
    assert_eq!(response.status(), 401);

    let right = format!("Basic {}", STANDARD.encode("admin:secret"));
    let response = site.respond(&multipart("/private/", "a.txt", "x", Some(&right)));
    assert_eq!(response.status(), 201);
    assert!(site.root().join("private/a.txt").is_file());

    // GET is not challenged.
    assert_eq!(site.respond(&get("/private/")).status(), 403);
}

#[test]
fn test_authenticator_is_pluggable() {
    let site = Site::new();
    let raw = multipart("/private/", "b.txt", "y", None);
    match site.route_with(&raw, &Fixed(true)) {
        Outcome::Respond(response) => assert_eq!(response.status(), 201),
        Outcome::Gateway(job) => panic!("unexpected gateway job {:?}", job),
    }
    match site.route_with(&raw, &Fixed(false)) {
        Outcome::Respond(response) => assert_eq!(response.status(), 401),
        Outcome::Gateway(job) => panic!("unexpected gateway job {:?}", job),
    }
}

#[test]
fn test_cgi_requests_become_gateway_jobs() {
    let site = Site::new();
    let root = site.root().to_str().unwrap();
    let script = format!("{}/cgi-bin/run.sh", root);

    match site.route(&get("/cgi-bin/run.sh?x=1")) {
        Outcome::Gateway(job) => {
            assert_eq!(job.script, script);
            assert_eq!(job.interpreter, None);
            assert_eq!(job.document_root, root);
            assert_eq!(job.script_name, "/cgi-bin/run.sh");
            assert_eq!(job.path_info, None);
        }
        Outcome::Respond(response) => panic!("unexpected status {}", response.status()),
    }

    match site.route(&get("/cgi-bin/run.sh/users/7")) {
        Outcome::Gateway(job) => {
            assert_eq!(job.script, script);
            assert_eq!(job.script_name, "/cgi-bin/run.sh");
            assert_eq!(job.path_info.as_deref(), Some("/users/7"));
        }
        Outcome::Respond(response) => panic!("unexpected status {}", response.status()),
    }

    assert_eq!(site.respond(&get("/cgi-bin/none.sh/users")).status(), 404);
}

#[test]
fn test_body_limit_violation_maps_to_413() {
    let site = Site::new();
    let mut request = Request::new();
    request.set_max_body_size(site.config.servers[0].max_body_size("/files/"));
    request.feed(b"POST /files/ HTTP/1.1\r\nContent-Length: 4096\r\n\r\n");
    let outcome = Router::new(&site.config.servers[0], &UserFile).handle(&request);
    match outcome {
        Outcome::Respond(response) => assert_eq!(response.status(), 413),
        Outcome::Gateway(job) => panic!("unexpected gateway job {:?}", job),
    }
}
