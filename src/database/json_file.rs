// =============================================================================
// Matrixon Identity - JSON File Store
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Identity service state in a single JSON document. Every change rewrites
//   the whole file through a temporary sibling and a rename, so readers never
//   see a half-written document.
//
// =============================================================================

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
    service::identity::{BindingSession, Data, ThreePid},
    Error, Result,
};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct IdentityState {
    #[serde(default)]
    identity_server: Option<String>,
    #[serde(default)]
    pending_bindings: Vec<BindingSession>,
}

pub struct JsonFileData {
    path: PathBuf,
    state: RwLock<IdentityState>,
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("identity state lock poisoned".to_string())
}

impl JsonFileData {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                error!("❌ Corrupt identity state in {}: {}", path.display(), e);
                Error::Storage(format!("corrupt identity state in {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No identity state at {}, starting empty", path.display());
                IdentityState::default()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "💾 Identity state loaded from {} ({} pending bindings)",
            path.display(),
            state.pending_bindings.len()
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IdentityState>> {
        self.state.write().map_err(poisoned)
    }

    fn persist(&self, state: &IdentityState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Storage(format!("failed to serialize identity state: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Data for JsonFileData {
    fn identity_server_url(&self) -> Result<Option<String>> {
        Ok(self.state.read().map_err(poisoned)?.identity_server.clone())
    }

    fn set_identity_server_url(&self, url: Option<&str>) -> Result<()> {
        let mut state = self.write()?;
        let mut next = state.clone();
        next.identity_server = url.map(str::to_owned);
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    fn save_pending_binding(&self, session: &BindingSession) -> Result<()> {
        let mut state = self.write()?;
        let mut next = state.clone();
        match next
            .pending_bindings
            .iter_mut()
            .find(|stored| stored.threepid == session.threepid)
        {
            Some(stored) => *stored = session.clone(),
            None => next.pending_bindings.push(session.clone()),
        }
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    fn delete_pending_binding(&self, threepid: &ThreePid) -> Result<()> {
        let mut state = self.write()?;
        if !state.pending_bindings.iter().any(|stored| &stored.threepid == threepid) {
            return Ok(());
        }

        let mut next = state.clone();
        next.pending_bindings.retain(|stored| &stored.threepid != threepid);
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    fn pending_bindings(&self) -> Result<Vec<BindingSession>> {
        Ok(self.state.read().map_err(poisoned)?.pending_bindings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::identity::BindingState;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let data = JsonFileData::open(dir.path().join("identity.json")).unwrap();

        assert_eq!(data.identity_server_url().unwrap(), None);
        assert!(data.pending_bindings().unwrap().is_empty());
        assert!(!data.path().exists());
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(JsonFileData::open(&path), Err(Error::Storage(_))));
    }

    #[test]
    fn test_save_replaces_session_for_same_threepid() {
        let dir = TempDir::new().unwrap();
        let data = JsonFileData::open(dir.path().join("nested/identity.json")).unwrap();
        let threepid = ThreePid::email("alice@example.com").unwrap();

        let mut session = BindingSession::new(threepid.clone(), "https://id.example.org", 1);
        session.sid = Some("sid1".to_string());
        session.state = BindingState::CodeSent;
        data.save_pending_binding(&session).unwrap();

        session.state = BindingState::Submitted;
        data.save_pending_binding(&session).unwrap();

        let stored = data.pending_bindings().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, BindingState::Submitted);

        data.delete_pending_binding(&threepid).unwrap();
        assert!(data.pending_bindings().unwrap().is_empty());
        assert!(!dir.path().join("nested/identity.json.tmp").exists());
    }
}
