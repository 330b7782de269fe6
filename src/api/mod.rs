// =============================================================================
// Matrixon Identity - HTTP API Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   reqwest-backed clients for the identity server (API v2) and the
//   homeserver (client-server API v3), plus the response handling they share.
//
// =============================================================================

mod homeserver_client;
mod identity_client;

pub use homeserver_client::HomeserverClient;
pub use identity_client::IdentityServerClient;

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::error;
use url::Url;

use crate::{Error, Result};

/// Standard Matrix error body
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MatrixError {
    pub errcode: String,
    #[serde(default)]
    pub error: String,
}

pub(crate) fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("matrixon-identity/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| {
            error!("❌ Failed to create HTTP client: {}", e);
            Error::BadConfig(format!("failed to create HTTP client: {e}"))
        })
}

/// `base` joined with an absolute API `path`
pub(crate) fn endpoint(base: &str, path: &str) -> Result<Url> {
    Ok(Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))?)
}

/// Failures that have nothing to do with the request itself
fn transport_error(status: StatusCode, body: Option<&MatrixError>) -> Option<Error> {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        let detail = body.map(|e| e.errcode.as_str()).unwrap_or("no errcode");
        return Some(Error::Unreachable(format!("{status} ({detail})")));
    }
    None
}

/// Anything not mapped by an endpoint-specific rule
pub(crate) fn unexpected_response(status: StatusCode, body: Option<&MatrixError>) -> Error {
    if let Some(e) = transport_error(status, body) {
        return e;
    }
    match body {
        Some(e) => Error::MalformedResponse(format!("{status} {}: {}", e.errcode, e.error)),
        None => Error::MalformedResponse(format!("{status} without a Matrix error body")),
    }
}

/// Decode a success body, or hand the status and Matrix error body to
/// `map_error`.
pub(crate) async fn parse_response<T, F>(response: Response, map_error: F) -> Result<T>
where
    T: DeserializeOwned,
    F: FnOnce(StatusCode, Option<&MatrixError>) -> Error,
{
    let status = response.status();
    let body = response.bytes().await?;

    if status.is_success() {
        return serde_json::from_slice(&body)
            .map_err(|e| Error::MalformedResponse(format!("undecodable response body: {e}")));
    }

    let matrix_error: Option<MatrixError> = serde_json::from_slice(&body).ok();
    Err(map_error(status, matrix_error.as_ref()))
}
