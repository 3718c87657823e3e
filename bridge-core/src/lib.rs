//! Core library for the router bridge controller.
//! This crate drives a RouterOS wireless interface over its REST API
//! (scan, security profiles, station connect) and keeps the device itself
//! reachable by falling back to a local access point when its own station
//! link is down. The HTTP boundary the browser UI talks to lives in
//! [`web_server`].

pub mod bridge;
pub mod config;
pub mod frontends;
pub mod link;
pub mod profiles;
pub mod router;
pub mod scan;
pub mod storage;
pub mod supervisor;
pub mod traits;
pub mod web_server;
pub mod wireless;

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection failure or timeout while talking to the router.
    #[error("Router unreachable: {0}")]
    RemoteUnreachable(String),

    /// The router answered with a non-2xx status.
    #[error("Router rejected request ({status}): {body}")]
    RemoteRejected { status: u16, body: String },

    #[error("Unexpected router response: {0}")]
    UnexpectedResponse(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Password required for secured profile '{0}'")]
    CredentialRequired(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Web server error: {0}")]
    WebServer(#[from] axum::BoxError),
}

impl Error {
    /// HTTP status used when this error crosses the web boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) | Error::AssetNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) | Error::CredentialRequired(_) => StatusCode::BAD_REQUEST,
            Error::RemoteUnreachable(_)
            | Error::RemoteRejected { .. }
            | Error::UnexpectedResponse(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;
