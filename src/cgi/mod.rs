//! CGI/1.1 gateway.
//!
//! A [`CgiJob`] names the script chosen by the router. [`execute`] validates
//! it, builds the meta-variable environment, runs the subprocess under a
//! deadline and parses what it printed. [`respond`] turns the result, good or
//! bad, into the HTTP response sent to the client.

mod env;
mod output;
mod process;

use std::fs;
use std::io;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::http::status;
use crate::http::{Request, Response};
use crate::pages::ErrorPages;

pub use env::{environment, GATEWAY_INTERFACE, SAFE_PATH};
pub use output::{parse_output, CgiOutput};

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("refusing to run {0}")]
    InvalidScript(String),
    #[error("failed to start {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("script produced no output")]
    EmptyOutput,
    #[error("malformed CGI header line {0:?}")]
    MalformedOutput(String),
}

impl CgiError {
    pub fn status(&self) -> u16 {
        match self {
            CgiError::InvalidScript(_) | CgiError::MalformedOutput(_) => {
                status::INTERNAL_SERVER_ERROR
            }
            CgiError::Spawn { .. } | CgiError::EmptyOutput => status::BAD_GATEWAY,
        }
    }
}

/// The script a request was routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiJob {
    pub script: String,
    /// `None` executes the script itself.
    pub interpreter: Option<String>,
    pub document_root: String,
    /// URI path naming the script, without any trailing path info.
    pub script_name: String,
    pub path_info: Option<String>,
}

/// Connection facts the environment needs besides the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiContext {
    pub server_name: String,
    pub server_port: u16,
    pub remote_addr: IpAddr,
}

#[derive(Debug)]
pub enum CgiOutcome {
    Completed(CgiOutput),
    TimedOut,
}

pub fn execute(
    job: &CgiJob,
    request: &Request,
    context: &CgiContext,
    timeout: Duration,
) -> Result<CgiOutcome, CgiError> {
    validate_script(&job.script)?;
    let env = environment(job, request, context);

    let (program, args) = match &job.interpreter {
        Some(interpreter) => (interpreter.as_str(), vec![job.script.as_str()]),
        None => (job.script.as_str(), Vec::new()),
    };
    let dir = Path::new(&job.script)
        .parent()
        .unwrap_or_else(|| Path::new("/"));

    debug!(script = %job.script, program, "running CGI script");
    let exit = process::run(program, &args, dir, &env, request.body(), timeout).map_err(
        |source| CgiError::Spawn {
            path: program.to_string(),
            source,
        },
    )?;

    match exit {
        process::Exit::TimedOut => {
            warn!(script = %job.script, timeout = ?timeout, "CGI script timed out");
            Ok(CgiOutcome::TimedOut)
        }
        process::Exit::Finished {
            status,
            stdout,
            stderr,
        } => {
            if !stderr.is_empty() {
                debug!(
                    script = %job.script,
                    stderr = %String::from_utf8_lossy(&stderr),
                    "CGI stderr"
                );
            }
            debug!(script = %job.script, %status, bytes = stdout.len(), "CGI script finished");
            if stdout.is_empty() {
                return Err(CgiError::EmptyOutput);
            }
            parse_output(&stdout).map(CgiOutcome::Completed)
        }
    }
}

/// Maps a gateway result onto the response sent to the client.
pub fn respond(result: Result<CgiOutcome, CgiError>, pages: &ErrorPages) -> Response {
    match result {
        Ok(CgiOutcome::Completed(output)) => output.into_response(),
        Ok(CgiOutcome::TimedOut) => pages.response(status::GATEWAY_TIMEOUT),
        Err(err) => {
            warn!(error = %err, "CGI request failed");
            pages.response(err.status())
        }
    }
}

/// The script must be an executable regular file named by a clean absolute
/// path.
pub fn validate_script(path: &str) -> Result<(), CgiError> {
    let invalid = || CgiError::InvalidScript(path.to_string());
    if !path.starts_with('/') || path.contains("..") || path.contains("//") {
        return Err(invalid());
    }
    let meta = fs::metadata(path).map_err(|_| invalid())?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(invalid());
    }
    Ok(())
}
