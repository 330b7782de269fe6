// =============================================================================
// Matrixon Identity - Collaborator API Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Outbound interfaces used by the identity service: the identity server
//   itself, the user's homeserver, and well-known discovery. Transports
//   implement these; the service only sees success or a structured `Error`.
//
// =============================================================================

use async_trait::async_trait;

use super::{FoundThreePid, ThreePid};
use crate::Result;

/// Identity service API v2, addressed by base URL
#[async_trait]
pub trait IdentityServerApi: Send + Sync {
    /// Status check. Succeeds only when the server speaks v2.
    async fn status(&self, base_url: &str) -> Result<()>;

    /// Ask the identity server to send a validation code. Returns the `sid`.
    async fn request_token(
        &self,
        base_url: &str,
        threepid: &ThreePid,
        client_secret: &str,
        send_attempt: u32,
    ) -> Result<String>;

    async fn submit_token(
        &self,
        base_url: &str,
        threepid: &ThreePid,
        sid: &str,
        client_secret: &str,
        token: &str,
    ) -> Result<()>;

    /// Batch lookup. Only matched ThreePids are returned.
    async fn lookup(&self, base_url: &str, threepids: &[ThreePid]) -> Result<Vec<FoundThreePid>>;
}

/// Homeserver account calls that associate a validated ThreePid
#[async_trait]
pub trait HomeserverApi: Send + Sync {
    async fn bind_threepid(&self, identity_server: &str, sid: &str, client_secret: &str) -> Result<()>;

    async fn unbind_threepid(&self, identity_server: &str, threepid: &ThreePid) -> Result<()>;
}

/// `.well-known/matrix/client` lookup for the homeserver's advertised identity server
#[async_trait]
pub trait WellKnownResolver: Send + Sync {
    /// `Ok(None)` when nothing is advertised; `Err` only on transport failure
    async fn identity_server(&self) -> Result<Option<String>>;
}
