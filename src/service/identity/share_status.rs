// =============================================================================
// Matrixon Identity - Share Status Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Combines a lookup with locally tracked bindings into a per-ThreePid
//   share status. The identity server's answer always wins.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{binding::ThreePidBindingTracker, lookup::LookupClient, ThreePid};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SharedState {
    NotShared,
    BindingInProgress,
    Shared,
}

pub struct ShareStatusAggregator {
    lookup: Arc<LookupClient>,
    tracker: Arc<ThreePidBindingTracker>,
}

impl ShareStatusAggregator {
    pub fn new(lookup: Arc<LookupClient>, tracker: Arc<ThreePidBindingTracker>) -> Self {
        Self { lookup, tracker }
    }

    #[instrument(level = "debug", skip(self, threepids), fields(count = threepids.len()))]
    pub async fn share_status(
        &self,
        identity_server: &str,
        threepids: &[ThreePid],
    ) -> Result<HashMap<ThreePid, SharedState>> {
        let found = self.lookup.look_up(identity_server, threepids).await?;
        let shared: HashSet<ThreePid> = found.into_iter().map(|entry| entry.threepid).collect();

        let status: HashMap<ThreePid, SharedState> = threepids
            .iter()
            .map(|threepid| {
                let state = if shared.contains(threepid) {
                    SharedState::Shared
                } else if self.tracker.is_binding_in_progress(threepid) {
                    SharedState::BindingInProgress
                } else {
                    SharedState::NotShared
                };
                (threepid.clone(), state)
            })
            .collect();

        debug!("📊 Share status computed for {} ThreePids", status.len());
        Ok(status)
    }
}
