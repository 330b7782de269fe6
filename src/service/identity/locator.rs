// =============================================================================
// Matrixon Identity - Server Locator Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Resolves which identity server is in effect. The configuration is
//   published as an immutable snapshot so every request sees one consistent
//   (url, validation) pair for its whole lifetime.
//
// =============================================================================

use std::{
    sync::{Arc, RwLock},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{
    api::{IdentityServerApi, WellKnownResolver},
    listeners::{IdentityEvent, ListenerRegistry},
    Data,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValidationStatus {
    #[default]
    Unchecked,
    Valid,
    InvalidVersion,
    Unreachable,
}

/// Immutable view of the identity server configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityServerConfig {
    /// `None` means no identity server is configured
    pub current: Option<String>,
    /// Last identity server advertised through well-known
    pub default: Option<String>,
    pub validation: ValidationStatus,
}

/// Adds `https://` when no scheme is given and strips the trailing slash
pub fn normalize_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("identity server url is empty".to_string()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = Url::parse(&candidate)?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(Error::InvalidInput(format!("not an http(s) url: {url}")));
    }

    Ok(parsed.as_str().trim_end_matches('/').to_owned())
}

/// `host[:port]` form the homeserver expects in `id_server`
pub fn server_host(url: &str) -> Result<String> {
    let parsed = Url::parse(&normalize_url(url)?)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::InvalidInput(format!("no host in {url}")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

pub struct ServerLocator {
    config: RwLock<Arc<IdentityServerConfig>>,
    identity_api: Arc<dyn IdentityServerApi>,
    well_known: Arc<dyn WellKnownResolver>,
    data: Arc<dyn Data>,
    listeners: Arc<ListenerRegistry>,
}

impl ServerLocator {
    pub fn new(
        identity_api: Arc<dyn IdentityServerApi>,
        well_known: Arc<dyn WellKnownResolver>,
        data: Arc<dyn Data>,
        listeners: Arc<ListenerRegistry>,
    ) -> Result<Self> {
        let current = match data.identity_server_url()? {
            Some(stored) => match normalize_url(&stored) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("⚠️ Ignoring stored identity server {:?}: {}", stored, e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            config: RwLock::new(Arc::new(IdentityServerConfig {
                current,
                ..Default::default()
            })),
            identity_api,
            well_known,
            data,
            listeners,
        })
    }

    pub fn snapshot(&self) -> Arc<IdentityServerConfig> {
        match self.config.read() {
            Ok(config) => Arc::clone(&config),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.snapshot().current.clone()
    }

    pub fn require_current(&self) -> Result<String> {
        self.current().ok_or(Error::NoIdentityServerConfigured)
    }

    fn publish(&self, update: impl FnOnce(&IdentityServerConfig) -> IdentityServerConfig) {
        let mut config = match self.config.write() {
            Ok(config) => config,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = update(&config);
        *config = Arc::new(next);
    }

    /// Well-known discovery. Nothing advertised is `Ok(None)`.
    #[instrument(level = "debug", skip(self))]
    pub async fn default_identity_server(&self) -> Result<Option<String>> {
        let start = Instant::now();
        debug!("🔍 Looking up default identity server");

        let advertised = match self.well_known.identity_server().await? {
            Some(url) => Some(normalize_url(&url).map_err(|e| {
                Error::MalformedResponse(format!("well-known identity server: {e}"))
            })?),
            None => None,
        };

        self.publish(|config| IdentityServerConfig {
            default: advertised.clone(),
            ..config.clone()
        });

        debug!("✅ Default identity server {:?} found in {:?}", advertised, start.elapsed());
        Ok(advertised)
    }

    /// Status check against `url`. Returns the normalized url on success.
    #[instrument(level = "debug", skip(self))]
    pub async fn check(&self, url: &str) -> Result<String> {
        let start = Instant::now();
        let url = normalize_url(url)?;
        debug!("🔧 Checking identity server {}", url);

        self.identity_api.status(&url).await.map_err(|e| {
            warn!("❌ Identity server {} rejected: {}", url, e);
            e
        })?;

        debug!("✅ Identity server {} supports v2 ({:?})", url, start.elapsed());
        Ok(url)
    }

    /// Switch identity server. `None` disconnects. Nothing changes unless the
    /// new server passes validation.
    #[instrument(level = "info", skip(self))]
    pub async fn set_identity_server(&self, url: Option<&str>) -> Result<Option<String>> {
        let start = Instant::now();

        let committed = match url {
            None => {
                self.data.set_identity_server_url(None)?;
                self.publish(|config| IdentityServerConfig {
                    current: None,
                    validation: ValidationStatus::Unchecked,
                    ..config.clone()
                });
                info!("🔌 Disconnected from identity server");
                None
            }
            Some(url) => {
                let url = self.check(url).await?;
                self.data.set_identity_server_url(Some(&url))?;
                self.publish(|config| IdentityServerConfig {
                    current: Some(url.clone()),
                    validation: ValidationStatus::Valid,
                    ..config.clone()
                });
                info!("✅ Identity server set to {} in {:?}", url, start.elapsed());
                Some(url)
            }
        };

        self.listeners.emit(IdentityEvent::IdentityServerChanged {
            url: committed.clone(),
        });
        Ok(committed)
    }

    /// Record the outcome of a status check on the current server, if it is
    /// still the current one.
    pub fn record_validation(&self, url: &str, result: &Result<String>) {
        let status = match result {
            Ok(_) => ValidationStatus::Valid,
            Err(Error::UnsupportedServerVersion(_)) | Err(Error::MalformedResponse(_)) => {
                ValidationStatus::InvalidVersion
            }
            Err(Error::Unreachable(_)) => ValidationStatus::Unreachable,
            Err(_) => return,
        };

        self.publish(|config| {
            if config.current.as_deref() == Some(url) {
                IdentityServerConfig {
                    validation: status,
                    ..config.clone()
                }
            } else {
                config.clone()
            }
        });
    }
}
