//! An HTTP/1.1 server with CGI support, driven by one epoll reactor thread.
//!
//! The [`reactor`] owns every socket and drives the incremental [`http`]
//! parser. Complete requests go through the [`router`], which serves files,
//! directory listings, uploads and redirects itself and hands scripts to the
//! [`cgi`] gateway.

pub mod auth;
pub mod cgi;
pub mod config;
pub mod error;
pub mod http;
pub mod pages;
pub mod reactor;
pub mod router;
pub mod shutdown;
pub mod upload;

pub use config::Config;
pub use error::{Result, ServerError};
pub use reactor::Reactor;
pub use shutdown::Shutdown;
