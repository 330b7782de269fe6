// =============================================================================
// Matrixon Identity - Homeserver Client
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Client-server API calls the identity service needs from the homeserver:
//   3pid bind/unbind and well-known discovery.
//
// =============================================================================

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{build_http_client, endpoint, parse_response, unexpected_response, MatrixError};
use crate::{
    service::identity::{server_host, HomeserverApi, ThreePid, WellKnownResolver},
    Error, Result,
};

#[derive(Debug, Serialize)]
struct BindBody<'a> {
    client_secret: &'a str,
    id_server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_access_token: Option<&'a str>,
    sid: &'a str,
}

#[derive(Debug, Serialize)]
struct UnbindBody<'a> {
    address: &'a str,
    medium: &'a str,
    id_server: String,
}

#[derive(Debug, Default, Deserialize)]
struct ClientWellKnown {
    #[serde(rename = "m.identity_server")]
    identity_server: Option<IdentityServerInfo>,
}

#[derive(Debug, Deserialize)]
struct IdentityServerInfo {
    base_url: String,
}

fn bind_error(status: StatusCode, body: Option<&MatrixError>) -> Error {
    match body.map(|e| e.errcode.as_str()) {
        Some("M_SESSION_EXPIRED") | Some("M_NO_VALID_SESSION") | Some("M_THREEPID_AUTH_FAILED") => {
            Error::SessionExpired
        }
        _ => unexpected_response(status, body),
    }
}

pub struct HomeserverClient {
    http: reqwest::Client,
    homeserver_url: String,
    server_name: String,
    access_token: Option<String>,
    identity_access_token: Option<String>,
}

impl HomeserverClient {
    pub fn new(
        homeserver_url: &str,
        server_name: &str,
        access_token: Option<String>,
        identity_access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: build_http_client(timeout)?,
            homeserver_url: homeserver_url.trim_end_matches('/').to_owned(),
            server_name: server_name.to_owned(),
            access_token,
            identity_access_token,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        match &self.access_token {
            Some(token) => Ok(request.bearer_auth(token)),
            None => Err(Error::BadConfig("homeserver access token is not configured".to_string())),
        }
    }

    fn well_known_url(&self) -> String {
        format!("https://{}/.well-known/matrix/client", self.server_name)
    }
}

#[async_trait]
impl HomeserverApi for HomeserverClient {
    #[instrument(level = "debug", skip(self, client_secret))]
    async fn bind_threepid(&self, identity_server: &str, sid: &str, client_secret: &str) -> Result<()> {
        let start = Instant::now();
        let body = BindBody {
            client_secret,
            id_server: server_host(identity_server)?,
            id_access_token: self.identity_access_token.as_deref(),
            sid,
        };

        let url = endpoint(&self.homeserver_url, "/_matrix/client/v3/account/3pid/bind")?;
        let response = self.authorized(self.http.post(url))?.json(&body).send().await?;
        let _: serde_json::Value = parse_response(response, bind_error).await?;

        debug!("🔗 Homeserver accepted bind in {:?}", start.elapsed());
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn unbind_threepid(&self, identity_server: &str, threepid: &ThreePid) -> Result<()> {
        let body = UnbindBody {
            address: threepid.address(),
            medium: threepid.medium_str(),
            id_server: server_host(identity_server)?,
        };

        let url = endpoint(&self.homeserver_url, "/_matrix/client/v3/account/3pid/unbind")?;
        let response = self.authorized(self.http.post(url))?.json(&body).send().await?;
        let _: serde_json::Value = parse_response(response, unexpected_response).await?;
        Ok(())
    }
}

#[async_trait]
impl WellKnownResolver for HomeserverClient {
    #[instrument(level = "debug", skip(self))]
    async fn identity_server(&self) -> Result<Option<String>> {
        let response = self.http.get(self.well_known_url()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            info!("No well-known document for {}", self.server_name);
            return Ok(None);
        }

        let well_known: ClientWellKnown = parse_response(response, unexpected_response).await?;
        Ok(well_known.identity_server.map(|info| info.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_mapping() {
        for errcode in ["M_SESSION_EXPIRED", "M_NO_VALID_SESSION", "M_THREEPID_AUTH_FAILED"] {
            let body = MatrixError {
                errcode: errcode.to_string(),
                error: String::new(),
            };
            assert!(matches!(bind_error(StatusCode::BAD_REQUEST, Some(&body)), Error::SessionExpired));
        }
        assert!(matches!(bind_error(StatusCode::GATEWAY_TIMEOUT, None), Error::Unreachable(_)));
    }

    #[test]
    fn test_bind_body_uses_bare_host() {
        let body = BindBody {
            client_secret: "secret",
            id_server: server_host("https://id.example.org:8090/").unwrap(),
            id_access_token: None,
            sid: "sid1",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["id_server"], "id.example.org:8090");
        assert!(json.get("id_access_token").is_none());
    }

    #[test]
    fn test_unbind_body() {
        let threepid = ThreePid::msisdn("+44 7700 900123").unwrap();
        let body = UnbindBody {
            address: threepid.address(),
            medium: threepid.medium_str(),
            id_server: server_host("https://vector.im").unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"address": "447700900123", "medium": "msisdn", "id_server": "vector.im"})
        );
    }

    #[test]
    fn test_well_known_parsing() {
        let document: ClientWellKnown = serde_json::from_str(
            r#"{"m.homeserver":{"base_url":"https://matrix.example.org"},
                "m.identity_server":{"base_url":"https://vector.im"}}"#,
        )
        .unwrap();
        assert_eq!(document.identity_server.unwrap().base_url, "https://vector.im");

        let bare: ClientWellKnown =
            serde_json::from_str(r#"{"m.homeserver":{"base_url":"https://matrix.example.org"}}"#).unwrap();
        assert!(bare.identity_server.is_none());
    }

    #[test]
    fn test_well_known_url() {
        let client = HomeserverClient::new(
            "https://matrix.example.org/",
            "example.org",
            None,
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.well_known_url(), "https://example.org/.well-known/matrix/client");
        assert_eq!(client.homeserver_url, "https://matrix.example.org");
    }
}
