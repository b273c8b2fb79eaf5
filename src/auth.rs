//! HTTP Basic authentication.

use std::fs;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::warn;

use crate::config::BasicAuth;

/// Grants or denies a request given its `Authorization` header.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, auth: &BasicAuth, authorization: Option<&str>) -> bool;
}

/// Checks credentials against a file of `user:password` lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserFile;

impl Authenticator for UserFile {
    fn authenticate(&self, auth: &BasicAuth, authorization: Option<&str>) -> bool {
        let (user, password) = match authorization.and_then(basic_credentials) {
            Some(credentials) => credentials,
            None => return false,
        };
        let content = match fs::read_to_string(&auth.user_file) {
            Ok(content) => content,
            Err(err) => {
                warn!(file = %auth.user_file, error = %err, "cannot read user file");
                return false;
            }
        };
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .any(|(u, p)| u == user && p == password)
    }
}

/// Decodes `Basic <base64(user:password)>`.
pub fn basic_credentials(authorization: &str) -> Option<(String, String)> {
    let (scheme, encoded) = authorization.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

pub fn challenge(auth: &BasicAuth) -> String {
    format!("Basic realm=\"{}\"", auth.realm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(credentials: &str) -> String {
        format!("Basic {}", STANDARD.encode(credentials))
    }

    #[test]
    fn decodes_basic_credentials() {
        assert_eq!(
            basic_credentials(&header("alice:s3cr:et")),
            Some(("alice".to_string(), "s3cr:et".to_string()))
        );
        assert_eq!(basic_credentials("Bearer abc"), None);
        assert_eq!(basic_credentials("Basic !!!"), None);
    }

    #[test]
    fn user_file_grants_listed_users() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("users");
        fs::write(&file, "# admins\nalice:wonderland\nbob:builder\n").unwrap();
        let auth = BasicAuth {
            realm: "private".to_string(),
            user_file: file.to_string_lossy().into_owned(),
        };

        assert!(UserFile.authenticate(&auth, Some(&header("bob:builder"))));
        assert!(!UserFile.authenticate(&auth, Some(&header("bob:wrong"))));
        assert!(!UserFile.authenticate(&auth, None));
        assert_eq!(challenge(&auth), "Basic realm=\"private\"");
    }
}
