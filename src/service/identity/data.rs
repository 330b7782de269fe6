// =============================================================================
// Matrixon Identity - Data Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Persistence boundary for identity state that has to survive a restart:
//   the configured identity server and pending binding sessions.
//
// =============================================================================

use std::{
    collections::HashMap,
    sync::RwLock,
};

use super::{BindingSession, ThreePid};
use crate::{Error, Result};

pub trait Data: Send + Sync {
    fn identity_server_url(&self) -> Result<Option<String>>;

    fn set_identity_server_url(&self, url: Option<&str>) -> Result<()>;

    fn save_pending_binding(&self, session: &BindingSession) -> Result<()>;

    fn delete_pending_binding(&self, threepid: &ThreePid) -> Result<()>;

    fn pending_bindings(&self) -> Result<Vec<BindingSession>>;
}

/// Process-lifetime storage, used when nothing needs to outlive the process
#[derive(Debug, Default)]
pub struct MemoryData {
    identity_server: RwLock<Option<String>>,
    bindings: RwLock<HashMap<ThreePid, BindingSession>>,
}

impl MemoryData {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("in-memory identity store lock poisoned".to_string())
}

impl Data for MemoryData {
    fn identity_server_url(&self) -> Result<Option<String>> {
        Ok(self.identity_server.read().map_err(poisoned)?.clone())
    }

    fn set_identity_server_url(&self, url: Option<&str>) -> Result<()> {
        *self.identity_server.write().map_err(poisoned)? = url.map(str::to_owned);
        Ok(())
    }

    fn save_pending_binding(&self, session: &BindingSession) -> Result<()> {
        self.bindings
            .write()
            .map_err(poisoned)?
            .insert(session.threepid.clone(), session.clone());
        Ok(())
    }

    fn delete_pending_binding(&self, threepid: &ThreePid) -> Result<()> {
        self.bindings.write().map_err(poisoned)?.remove(threepid);
        Ok(())
    }

    fn pending_bindings(&self) -> Result<Vec<BindingSession>> {
        Ok(self.bindings.read().map_err(poisoned)?.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::identity::BindingState;
    use test_log::test;

    #[test]
    fn test_identity_server_url_roundtrip() {
        let data = MemoryData::new();
        assert_eq!(data.identity_server_url().unwrap(), None);

        data.set_identity_server_url(Some("https://vector.im")).unwrap();
        assert_eq!(data.identity_server_url().unwrap().as_deref(), Some("https://vector.im"));

        data.set_identity_server_url(None).unwrap();
        assert_eq!(data.identity_server_url().unwrap(), None);
    }

    #[test]
    fn test_pending_binding_is_replaced_per_threepid() {
        let data = MemoryData::new();
        let threepid = ThreePid::email("alice@example.com").unwrap();

        let mut session = BindingSession::new(threepid.clone(), "https://id.example.org", 1);
        data.save_pending_binding(&session).unwrap();

        session.state = BindingState::CodeSent;
        session.sid = Some("sid-1".to_string());
        data.save_pending_binding(&session).unwrap();

        let stored = data.pending_bindings().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, BindingState::CodeSent);

        data.delete_pending_binding(&threepid).unwrap();
        assert!(data.pending_bindings().unwrap().is_empty());
    }
}
