// =============================================================================
// Matrixon Identity - Configuration Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Client configuration, loaded from an optional TOML file overlaid with
//   `MATRIXON_IDENTITY_*` environment variables.
//
// =============================================================================

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

pub const ENV_PREFIX: &str = "MATRIXON_IDENTITY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Client-server API base url of the homeserver
    pub homeserver_url: String,
    /// Server name, used for `.well-known` discovery
    pub server_name: String,
    #[serde(default)]
    pub access_token: Option<String>,

    /// Identity server to start with when none is stored yet
    #[serde(default)]
    pub identity_server: Option<String>,
    #[serde(default)]
    pub identity_access_token: Option<String>,

    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_log")]
    pub log: String,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("matrixon-identity.json")
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_requests() -> usize {
    16
}

fn default_log() -> String {
    "info".to_string()
}

impl IdentityConfig {
    /// Providers in precedence order, lowest first
    pub fn figment(path: Option<&Path>) -> Figment {
        let figment = Figment::new();
        let figment = match path {
            Some(path) => figment.merge(Toml::file(path)),
            None => figment,
        };
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| Error::BadConfig(e.to_string()))?;
        config.validate()?;
        debug!("🔧 Configuration loaded for {}", config.server_name);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.homeserver_url.trim().is_empty() {
            return Err(Error::BadConfig("homeserver_url is required".to_string()));
        }
        if self.server_name.trim().is_empty() {
            return Err(Error::BadConfig("server_name is required".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::BadConfig("request_timeout_secs must be positive".to_string()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(Error::BadConfig("max_concurrent_requests must be positive".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
