//! HTTP/1.1 wire handling.
//!
//! - **`request`**: incremental request decoder, including chunked bodies
//! - **`response`**: response accumulation and serialization
//! - **`status`**: reason phrases and error descriptions
//! - **`mime`**: content type lookup by file extension

pub mod mime;
pub mod request;
pub mod response;
pub mod status;

pub use request::{ParseError, Request};
pub use response::Response;
