// =============================================================================
// Matrixon Identity - Lookup Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Batch resolution of ThreePids to Matrix user ids.
//
// =============================================================================

use std::{
    collections::HashSet,
    sync::Arc,
    time::Instant,
};

use tracing::{debug, instrument, warn};

use super::{api::IdentityServerApi, FoundThreePid, ThreePid};
use crate::Result;

pub struct LookupClient {
    identity_api: Arc<dyn IdentityServerApi>,
}

impl LookupClient {
    pub fn new(identity_api: Arc<dyn IdentityServerApi>) -> Self {
        Self { identity_api }
    }

    /// One request for the whole batch. Only matched ThreePids that were
    /// actually asked for come back, each at most once.
    #[instrument(level = "debug", skip(self, threepids), fields(count = threepids.len()))]
    pub async fn look_up(&self, identity_server: &str, threepids: &[ThreePid]) -> Result<Vec<FoundThreePid>> {
        if threepids.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let mut unique: Vec<ThreePid> = Vec::with_capacity(threepids.len());
        let mut seen = HashSet::with_capacity(threepids.len());
        for threepid in threepids {
            if seen.insert(threepid) {
                unique.push(threepid.clone());
            }
        }

        let found = self.identity_api.lookup(identity_server, &unique).await?;

        let mut reported = HashSet::new();
        let matched: Vec<FoundThreePid> = found
            .into_iter()
            .filter(|entry| {
                if !seen.contains(&entry.threepid) {
                    warn!("⚠️ Ignoring unrequested lookup result for {}", entry.threepid);
                    return false;
                }
                reported.insert(entry.threepid.clone())
            })
            .collect();

        debug!(
            "✅ Lookup matched {}/{} ThreePids in {:?}",
            matched.len(),
            unique.len(),
            start.elapsed()
        );
        Ok(matched)
    }
}
