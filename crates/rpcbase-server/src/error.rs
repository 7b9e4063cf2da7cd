//! Error types for the base server.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors returned from [`BaseServer::serve`](crate::BaseServer::serve).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serve: {0}")]
    Serve(#[from] tonic::transport::Error),

    #[error("failed to build the reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    #[error("server was already served; a base server cannot be reused")]
    AlreadyServed,
}

/// Errors produced while loading or validating [`ServerSettings`](crate::ServerSettings).
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),
}
