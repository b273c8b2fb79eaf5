use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read config {path}: {source}")]
    ConfigRead { path: String, source: io::Error },

    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("no listening endpoint could be bound")]
    NoEndpoints,
}
