// =============================================================================
// Matrixon Identity - Service Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Service container wiring configuration, HTTP clients and storage into
//   the identity service.
//
// =============================================================================

use std::{sync::Arc, time::Instant};

use tracing::{debug, info, instrument};

use crate::{
    api::{HomeserverClient, IdentityServerClient},
    config::IdentityConfig,
    database::JsonFileData,
    Result,
};

pub mod identity;

pub struct Services {
    pub identity: identity::Service,
}

impl Services {
    /// Build every service from `config`. Must be called from within a
    /// tokio runtime.
    #[instrument(level = "info", skip(config), fields(server_name = %config.server_name))]
    pub fn build(config: &IdentityConfig) -> Result<Self> {
        let start = Instant::now();
        let timeout = config.request_timeout();

        let data = Arc::new(JsonFileData::open(&config.state_path)?);
        seed_identity_server(data.as_ref(), config)?;

        let identity_api = Arc::new(IdentityServerClient::new(
            timeout,
            config.identity_access_token.clone(),
        )?);
        let homeserver = Arc::new(HomeserverClient::new(
            &config.homeserver_url,
            &config.server_name,
            config.access_token.clone(),
            config.identity_access_token.clone(),
            timeout,
        )?);

        let identity = identity::Service::new(
            identity::Collaborators {
                identity_api,
                homeserver_api: homeserver.clone(),
                well_known: homeserver,
                data,
            },
            config.max_concurrent_requests,
        )?;

        info!("🎉 Services built in {:?}", start.elapsed());
        Ok(Self { identity })
    }
}

/// A configured identity server only applies while nothing is stored.
/// Yields the url it stored, which is not status-checked here.
fn seed_identity_server(data: &dyn identity::Data, config: &IdentityConfig) -> Result<Option<String>> {
    if data.identity_server_url()?.is_some() {
        return Ok(None);
    }
    let Some(url) = &config.identity_server else {
        return Ok(None);
    };

    let url = identity::normalize_url(url)?;
    data.set_identity_server_url(Some(&url))?;
    info!("🆔 Using configured identity server {}", url);
    debug!("Configured identity server {} is unchecked until `server check` succeeds", url);
    Ok(Some(url))
}
