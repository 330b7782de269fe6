// =============================================================================
// Matrixon Identity - Identity Server Client
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Identity service API v2 over reqwest: status, validation tokens and
//   privacy-preserving (hashed) lookups.
//
// =============================================================================

use std::{collections::HashMap, time::{Duration, Instant}};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reqwest::{RequestBuilder, StatusCode};
use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use super::{build_http_client, endpoint, parse_response, unexpected_response, MatrixError};
use crate::{
    service::identity::{FoundThreePid, IdentityServerApi, ThreePid},
    utils::error::CodeRejection,
    Error, Result,
};

const V2: &str = "/_matrix/identity/v2";

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestTokenBody<'a> {
    Email {
        client_secret: &'a str,
        email: &'a str,
        send_attempt: u32,
    },
    Msisdn {
        client_secret: &'a str,
        country: &'a str,
        phone_number: &'a str,
        send_attempt: u32,
    },
}

#[derive(Debug, Deserialize)]
struct RequestTokenResponse {
    sid: String,
}

#[derive(Debug, Serialize)]
struct SubmitTokenBody<'a> {
    client_secret: &'a str,
    sid: &'a str,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitTokenResponse {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct HashDetails {
    algorithms: Vec<String>,
    lookup_pepper: String,
}

#[derive(Debug, Serialize)]
struct LookupBody<'a> {
    addresses: Vec<String>,
    algorithm: &'a str,
    pepper: &'a str,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    mappings: HashMap<String, OwnedUserId>,
}

/// Hashed form of a ThreePid for `/lookup`
pub(crate) fn hash_threepid(threepid: &ThreePid, pepper: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{} {} {}", threepid.address(), threepid.medium_str(), pepper).as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn request_token_error(status: StatusCode, body: Option<&MatrixError>) -> Error {
    match body.map(|e| e.errcode.as_str()) {
        Some("M_THREEPID_IN_USE") => Error::AlreadyBound,
        _ => unexpected_response(status, body),
    }
}

fn submit_token_error(status: StatusCode, body: Option<&MatrixError>) -> Error {
    match body.map(|e| e.errcode.as_str()) {
        Some("M_INVALID_PARAM") => Error::InvalidOrExpiredCode(CodeRejection::InvalidCode),
        Some("M_SESSION_EXPIRED") | Some("M_NO_VALID_SESSION") => {
            Error::InvalidOrExpiredCode(CodeRejection::ExpiredSession)
        }
        _ => unexpected_response(status, body),
    }
}

fn status_error(status: StatusCode, body: Option<&MatrixError>) -> Error {
    if status.is_server_error() {
        return unexpected_response(status, body);
    }
    Error::UnsupportedServerVersion(format!("status check answered {status}"))
}

pub struct IdentityServerClient {
    http: reqwest::Client,
    access_token: Option<String>,
}

impl IdentityServerClient {
    pub fn new(timeout: Duration, access_token: Option<String>) -> Result<Self> {
        Ok(Self {
            http: build_http_client(timeout)?,
            access_token,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn hash_details(&self, base_url: &str) -> Result<HashDetails> {
        let url = endpoint(base_url, &format!("{V2}/hash_details"))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        parse_response(response, unexpected_response).await
    }
}

#[async_trait]
impl IdentityServerApi for IdentityServerClient {
    #[instrument(level = "debug", skip(self))]
    async fn status(&self, base_url: &str) -> Result<()> {
        let response = self.http.get(endpoint(base_url, V2)?).send().await?;
        let _: serde_json::Value = parse_response(response, status_error).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, client_secret))]
    async fn request_token(
        &self,
        base_url: &str,
        threepid: &ThreePid,
        client_secret: &str,
        send_attempt: u32,
    ) -> Result<String> {
        let url = endpoint(
            base_url,
            &format!("{V2}/validate/{}/requestToken", threepid.medium_str()),
        )?;
        let body = match threepid {
            ThreePid::Email(email) => RequestTokenBody::Email {
                client_secret,
                email,
                send_attempt,
            },
            ThreePid::Msisdn(number) => RequestTokenBody::Msisdn {
                client_secret,
                country: "",
                phone_number: number,
                send_attempt,
            },
        };

        let response = self.authorized(self.http.post(url)).json(&body).send().await?;
        let RequestTokenResponse { sid } = parse_response(response, request_token_error).await?;
        debug!("📧 Identity server opened session {}", sid);
        Ok(sid)
    }

    #[instrument(level = "debug", skip(self, client_secret, token))]
    async fn submit_token(
        &self,
        base_url: &str,
        threepid: &ThreePid,
        sid: &str,
        client_secret: &str,
        token: &str,
    ) -> Result<()> {
        let url = endpoint(
            base_url,
            &format!("{V2}/validate/{}/submitToken", threepid.medium_str()),
        )?;
        let body = SubmitTokenBody {
            client_secret,
            sid,
            token,
        };

        let response = self.authorized(self.http.post(url)).json(&body).send().await?;
        let SubmitTokenResponse { success } = parse_response(response, submit_token_error).await?;
        if !success {
            return Err(Error::InvalidOrExpiredCode(CodeRejection::InvalidCode));
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, threepids), fields(count = threepids.len()))]
    async fn lookup(&self, base_url: &str, threepids: &[ThreePid]) -> Result<Vec<FoundThreePid>> {
        let start = Instant::now();
        let details = self.hash_details(base_url).await?;
        if !details.algorithms.iter().any(|algorithm| algorithm == "sha256") {
            return Err(Error::UnsupportedServerVersion(format!(
                "no sha256 lookup support (offers {:?})",
                details.algorithms
            )));
        }

        let hashed: HashMap<String, &ThreePid> = threepids
            .iter()
            .map(|threepid| (hash_threepid(threepid, &details.lookup_pepper), threepid))
            .collect();
        let body = LookupBody {
            addresses: hashed.keys().cloned().collect(),
            algorithm: "sha256",
            pepper: &details.lookup_pepper,
        };

        let url = endpoint(base_url, &format!("{V2}/lookup"))?;
        let response = self.authorized(self.http.post(url)).json(&body).send().await?;
        let LookupResponse { mappings } = parse_response(response, unexpected_response).await?;

        let found: Vec<FoundThreePid> = mappings
            .into_iter()
            .filter_map(|(hash, user_id)| match hashed.get(&hash) {
                Some(threepid) => Some(FoundThreePid {
                    threepid: (*threepid).clone(),
                    user_id,
                }),
                None => {
                    warn!("⚠️ Identity server returned an unknown hash");
                    None
                }
            })
            .collect();

        debug!("🔍 Hashed lookup answered in {:?}", start.elapsed());
        Ok(found)
    }
}
