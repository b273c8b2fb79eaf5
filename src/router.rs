//! Request routing.
//!
//! [`Router::handle`] runs the handler chain for one complete request against
//! the virtual host it arrived on. Everything except CGI is answered on the
//! spot; CGI requests come back as a [`CgiJob`] for the gateway.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::auth::{self, Authenticator};
use crate::cgi::CgiJob;
use crate::config::{Location, Server, SUPPORTED_METHODS};
use crate::http::request::ParseError;
use crate::http::{mime, status, Request, Response};
use crate::pages::{self, ErrorPages};
use crate::upload;

#[derive(Debug)]
pub enum Outcome {
    Respond(Response),
    Gateway(CgiJob),
}

pub struct Router<'a> {
    server: &'a Server,
    authenticator: &'a dyn Authenticator,
}

impl<'a> Router<'a> {
    pub fn new(server: &'a Server, authenticator: &'a dyn Authenticator) -> Self {
        Router {
            server,
            authenticator,
        }
    }

    /// Error response using the server-wide error pages.
    pub fn error(&self, code: u16) -> Response {
        ErrorPages::for_server(self.server).response(code)
    }

    pub fn handle(&self, request: &Request) -> Outcome {
        if let Some(err) = request.error() {
            let code = match err {
                ParseError::HeaderTooLarge => status::REQUEST_HEADER_TOO_LARGE,
                ParseError::EntityTooLarge => status::PAYLOAD_TOO_LARGE,
            };
            return Outcome::Respond(self.error(code));
        }
        if request.method().is_empty() || request.uri().is_empty() {
            return Outcome::Respond(self.error(status::BAD_REQUEST));
        }
        if !SUPPORTED_METHODS.contains(&request.method()) {
            return Outcome::Respond(self.error(status::METHOD_NOT_ALLOWED));
        }

        let location = match self.server.location(request.uri()) {
            Some(location) => location,
            None => {
                debug!(uri = request.uri(), "no location matches");
                return Outcome::Respond(self.error(status::NOT_FOUND));
            }
        };
        LocationHandler {
            router: self,
            location,
            request,
            pages: ErrorPages::new(&self.server.root, &location.error_pages),
        }
        .handle()
    }
}

/// On-disk path for `uri` inside `location`. An alias replaces the matched
/// route prefix, a root is prepended to the whole URI. Exactly one `/`
/// separates the two halves.
pub fn resolve_path(location: &Location, uri: &str) -> String {
    match &location.alias {
        Some(alias) => {
            let rest = uri.strip_prefix(location.route.as_str()).unwrap_or("");
            join(alias, rest)
        }
        None => join(&location.root, uri),
    }
}

fn join(base: &str, rest: &str) -> String {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rest)
}

struct LocationHandler<'r, 'a> {
    router: &'r Router<'a>,
    location: &'a Location,
    request: &'r Request,
    pages: ErrorPages<'a>,
}

impl<'r, 'a> LocationHandler<'r, 'a> {
    fn handle(&self) -> Outcome {
        let location = self.location;
        let request = self.request;

        if let Some(redirect) = &location.redirect {
            info!(uri = request.uri(), target = %redirect.target, code = redirect.code, "redirect");
            let mut response =
                Response::html(redirect.code, pages::redirect_page(redirect.code, &redirect.target));
            response.set_header("Location", redirect.target.as_str());
            return Outcome::Respond(response);
        }

        if !location.allows(request.method()) {
            let mut response = self.pages.response(status::METHOD_NOT_ALLOWED);
            response.set_header("Allow", location.methods.join(", "));
            return Outcome::Respond(response);
        }

        if request.method() == "POST" {
            if let Some(basic) = &location.auth {
                if !self
                    .router
                    .authenticator
                    .authenticate(basic, request.header("authorization"))
                {
                    warn!(uri = request.uri(), realm = %basic.realm, "authentication failed");
                    let mut response = self.pages.response(status::UNAUTHORIZED);
                    response.set_header("WWW-Authenticate", auth::challenge(basic));
                    return Outcome::Respond(response);
                }
            }
        }

        if has_parent_segment(request.uri()) {
            return Outcome::Respond(self.pages.response(status::FORBIDDEN));
        }

        let path = resolve_path(location, request.uri());
        debug!(route = %location.route, uri = request.uri(), path = %path, "resolved");

        let is_dir = Path::new(&path).is_dir();
        if is_dir || request.uri().ends_with('/') {
            if !is_dir {
                return Outcome::Respond(self.pages.response(status::NOT_FOUND));
            }
            return self.directory(&path);
        }
        self.file(&path, request.uri().to_string())
    }

    fn directory(&self, dir: &str) -> Outcome {
        let request = self.request;
        match request.method() {
            "POST" if upload::is_multipart(request.header("content-type")) => {
                return Outcome::Respond(self.upload(dir));
            }
            "DELETE" => return Outcome::Respond(self.pages.response(status::FORBIDDEN)),
            _ => {}
        }

        if let Some(index) = self.location.index.first() {
            let candidate = join(dir, index);
            if Path::new(&candidate).is_file() {
                let script_name = join(request.uri(), index);
                let script_name = if script_name.starts_with('/') {
                    script_name
                } else {
                    format!("/{}", script_name)
                };
                return self.file(&candidate, script_name);
            }
        }

        if self.location.autoindex && request.method() == "GET" {
            return Outcome::Respond(match pages::directory_listing(Path::new(dir), request.uri()) {
                Ok(html) => Response::html(status::OK, html),
                Err(err) => {
                    warn!(path = %dir, error = %err, "directory listing failed");
                    self.pages.response(status::FORBIDDEN)
                }
            });
        }
        Outcome::Respond(self.pages.response(status::FORBIDDEN))
    }

    fn file(&self, path: &str, script_name: String) -> Outcome {
        let location = self.location;
        let exists = Path::new(path).exists();

        if exists {
            if let Some(interpreter) = location.interpreter_for(path) {
                return Outcome::Gateway(CgiJob {
                    script: path.to_string(),
                    interpreter: interpreter.clone(),
                    document_root: location.document_root().to_string(),
                    script_name,
                    path_info: None,
                });
            }
        } else {
            return match self.script_with_path_info(path) {
                Some(job) => Outcome::Gateway(job),
                None => Outcome::Respond(self.pages.response(status::NOT_FOUND)),
            };
        }

        if self.request.method() == "DELETE" {
            return Outcome::Respond(self.delete(path));
        }
        Outcome::Respond(self.serve(path))
    }

    /// Finds a CGI script among the ancestors of a missing `path` and treats
    /// the rest as path info, as in `/cgi-bin/app.py/users/7`.
    fn script_with_path_info(&self, path: &str) -> Option<CgiJob> {
        let location = self.location;
        let base = location.document_root();
        let uri = self.request.uri();

        let mut end = path.len();
        while let Some(pos) = path[..end].rfind('/') {
            if pos <= base.len() {
                return None;
            }
            let candidate = &path[..pos];
            if let Some(interpreter) = location.interpreter_for(candidate) {
                if Path::new(candidate).is_file() {
                    let path_info = &path[pos..];
                    let script_name = uri.strip_suffix(path_info).unwrap_or(uri);
                    return Some(CgiJob {
                        script: candidate.to_string(),
                        interpreter: interpreter.clone(),
                        document_root: base.to_string(),
                        script_name: script_name.to_string(),
                        path_info: Some(path_info.to_string()),
                    });
                }
            }
            end = pos;
        }
        None
    }

    fn delete(&self, path: &str) -> Response {
        match fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path, "deleted");
                Response::new(status::NO_CONTENT)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.pages.response(status::NOT_FOUND)
            }
            Err(err) => {
                warn!(path = %path, error = %err, "delete refused");
                self.pages.response(status::FORBIDDEN)
            }
        }
    }

    fn serve(&self, path: &str) -> Response {
        match fs::read(path) {
            Ok(content) => {
                let mut response = Response::new(status::OK);
                response.set_header("Content-Type", mime::from_path(path));
                response.set_body(content);
                response
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.pages.response(status::NOT_FOUND)
            }
            Err(err) => {
                warn!(path = %path, error = %err, "cannot read file");
                self.pages.response(status::FORBIDDEN)
            }
        }
    }

    fn upload(&self, dir: &str) -> Response {
        let request = self.request;
        let content_type = request.header("content-type").unwrap_or_default();
        let files = match upload::parse(content_type, request.body()) {
            Ok(files) => files,
            Err(err) => {
                warn!(uri = request.uri(), error = %err, "upload rejected");
                return self.pages.response(status::BAD_REQUEST);
            }
        };
        match upload::store(Path::new(dir), &files) {
            Ok(bytes) => {
                info!(dir = %dir, files = files.len(), bytes, "upload stored");
                let names = files
                    .iter()
                    .map(|f| format!("<li>{}</li>", f.filename))
                    .collect::<String>();
                Response::html(
                    status::CREATED,
                    format!(
                        "<!DOCTYPE html>\n<html><head><title>Upload Successful</title></head>\n<body>\n<h1>Upload Successful</h1>\n<ul>{}</ul>\n<p>{} bytes stored.</p>\n</body></html>\n",
                        names, bytes
                    ),
                )
            }
            Err(err) => {
                warn!(dir = %dir, error = %err, "cannot store upload");
                self.pages.response(status::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

fn has_parent_segment(uri: &str) -> bool {
    uri.split('/').any(|segment| segment == "..")
}
