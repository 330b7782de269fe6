// =============================================================================
// Matrixon Identity - ThreePid Binding Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Binding state machine, one session per ThreePid:
//
//     (none) -> Requested -> CodeSent -> Submitted -> Finalized
//                                \-> Cancelled     \-> Failed
//
//   Session state is only touched inside short synchronous critical
//   sections; network calls happen between them. A session's generation
//   tells a finishing request whether it was superseded in the meantime.
//
// =============================================================================

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    api::{HomeserverApi, IdentityServerApi},
    dispatcher::Cancelable,
    listeners::{IdentityEvent, ListenerRegistry},
    Data, ThreePid,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingState {
    /// Token requested, waiting for the identity server to acknowledge
    Requested,
    /// Identity server sent the code out of band
    CodeSent,
    /// Code accepted; ownership proven but not yet associated
    Submitted,
    Finalized,
    Cancelled,
    Failed,
}

impl BindingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Cancelled | Self::Failed)
    }
}

/// Pending binding of one ThreePid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSession {
    pub threepid: ThreePid,
    /// Identity server the session was started against
    pub identity_server: String,
    pub client_secret: String,
    /// Session id issued by the identity server
    pub sid: Option<String>,
    pub state: BindingState,
    /// Starts at 1 and grows with every resend
    pub send_attempt: u32,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

impl BindingSession {
    pub fn new(threepid: ThreePid, identity_server: &str, generation: u64) -> Self {
        Self {
            threepid,
            identity_server: identity_server.to_owned(),
            client_secret: Uuid::new_v4().simple().to_string(),
            sid: None,
            state: BindingState::Requested,
            send_attempt: 1,
            generation,
            created_at: Utc::now(),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.send_attempt.saturating_sub(1)
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Worth keeping across a restart: the identity server knows the session
    pub fn is_resumable(&self) -> bool {
        self.sid.is_some() && matches!(self.state, BindingState::CodeSent | BindingState::Submitted)
    }
}

struct Tracked {
    session: BindingSession,
    in_flight: Vec<Cancelable>,
}

impl Tracked {
    fn settle(&mut self, handle: &Cancelable) {
        self.in_flight.retain(|h| h.id() != handle.id());
    }
}

/// Registration of one request on a session. Dropped while still armed
/// (the task was aborted mid-request), it takes the request back off the
/// session and abandons a session that never got past `Requested`.
struct Registration<'a> {
    tracker: &'a ThreePidBindingTracker,
    threepid: &'a ThreePid,
    generation: u64,
    handle: &'a Cancelable,
    armed: bool,
}

impl Registration<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.abandon(self.threepid, self.generation, self.handle);
        }
    }
}

/// What a request needs to know about a session, captured under the lock
struct Snapshot {
    generation: u64,
    identity_server: String,
    client_secret: String,
    sid: Option<String>,
    send_attempt: u32,
}

pub struct ThreePidBindingTracker {
    sessions: Mutex<HashMap<ThreePid, Tracked>>,
    /// Orders writes to `data`; never taken while `sessions` is held
    persisting: Mutex<()>,
    generation: AtomicU64,
    identity_api: Arc<dyn IdentityServerApi>,
    homeserver_api: Arc<dyn HomeserverApi>,
    data: Arc<dyn Data>,
    listeners: Arc<ListenerRegistry>,
}

impl ThreePidBindingTracker {
    pub fn new(
        identity_api: Arc<dyn IdentityServerApi>,
        homeserver_api: Arc<dyn HomeserverApi>,
        data: Arc<dyn Data>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            persisting: Mutex::new(()),
            generation: AtomicU64::new(1),
            identity_api,
            homeserver_api,
            data,
            listeners,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ThreePid, Tracked>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, threepid: &ThreePid, state: BindingState) {
        self.listeners.emit(IdentityEvent::BindingStateChanged {
            threepid: threepid.clone(),
            state,
        });
    }

    /// Bring the stored copy of `threepid`'s session in line with memory.
    /// Only resumable sessions are stored. A storage failure is logged and
    /// does not undo what already happened on the servers.
    fn persist(&self, threepid: &ThreePid) {
        let _order = self.persisting.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let resumable = self
            .sessions()
            .get(threepid)
            .map(|tracked| tracked.session.clone())
            .filter(BindingSession::is_resumable);

        let result = match resumable {
            Some(session) => self.data.save_pending_binding(&session),
            None => self.data.delete_pending_binding(threepid),
        };
        if let Err(e) = result {
            error!("💾 Failed to persist binding of {}: {}", threepid, e);
        }
    }

    fn register<'a>(&'a self, threepid: &'a ThreePid, generation: u64, handle: &'a Cancelable) -> Registration<'a> {
        Registration {
            tracker: self,
            threepid,
            generation,
            handle,
            armed: true,
        }
    }

    /// A request on `threepid` went away without finishing
    fn abandon(&self, threepid: &ThreePid, generation: u64, handle: &Cancelable) {
        let mut sessions = self.sessions();
        let Some(tracked) = sessions.get_mut(threepid) else {
            return;
        };
        if tracked.session.generation != generation {
            return;
        }

        tracked.settle(handle);
        if tracked.session.state == BindingState::Requested {
            sessions.remove(threepid);
            self.notify(threepid, BindingState::Cancelled);
            info!("🚫 Binding of {} abandoned before a code was sent", threepid);
        }
    }

    /// Reload persisted sessions. Only sessions that obtained a `sid` can be
    /// resumed; anything else is dropped from storage.
    pub fn restore(&self) -> Result<usize> {
        let stored = self.data.pending_bindings()?;
        let mut sessions = self.sessions();
        let mut restored = 0;

        for session in stored {
            if !session.is_resumable() {
                debug!("🗑️ Dropping unresumable binding for {}", session.threepid);
                self.data.delete_pending_binding(&session.threepid)?;
                continue;
            }

            self.generation.fetch_max(session.generation + 1, Ordering::AcqRel);
            sessions.insert(
                session.threepid.clone(),
                Tracked {
                    session,
                    in_flight: Vec::new(),
                },
            );
            restored += 1;
        }

        info!("🔄 Restored {} pending bindings", restored);
        Ok(restored)
    }

    pub fn state(&self, threepid: &ThreePid) -> Option<BindingState> {
        self.sessions().get(threepid).map(|tracked| tracked.session.state)
    }

    /// True for any live (non-terminal) session
    pub fn is_binding_in_progress(&self, threepid: &ThreePid) -> bool {
        self.sessions()
            .get(threepid)
            .map(|tracked| tracked.session.is_live())
            .unwrap_or(false)
    }

    pub fn session(&self, threepid: &ThreePid) -> Option<BindingSession> {
        self.sessions().get(threepid).map(|tracked| tracked.session.clone())
    }

    pub fn pending_sessions(&self) -> Vec<BindingSession> {
        self.sessions()
            .values()
            .filter(|tracked| tracked.session.is_live())
            .map(|tracked| tracked.session.clone())
            .collect()
    }

    /// Look up the live session for `threepid` and check it is in one of
    /// `allowed`, registering `handle` as in flight on it.
    fn begin(
        &self,
        sessions: &mut HashMap<ThreePid, Tracked>,
        threepid: &ThreePid,
        allowed: &'static [BindingState],
        handle: &Cancelable,
    ) -> Result<Snapshot> {
        let tracked = match sessions.get_mut(threepid) {
            Some(tracked) if tracked.session.is_live() => tracked,
            _ => return Err(Error::NoActiveSession(threepid.clone())),
        };

        if !allowed.contains(&tracked.session.state) {
            return Err(Error::UnexpectedBindingState {
                threepid: threepid.clone(),
                expected: allowed,
                actual: Some(tracked.session.state),
            });
        }

        tracked.in_flight.push(handle.clone());
        Ok(Snapshot {
            generation: tracked.session.generation,
            identity_server: tracked.session.identity_server.clone(),
            client_secret: tracked.session.client_secret.clone(),
            sid: tracked.session.sid.clone(),
            send_attempt: tracked.session.send_attempt,
        })
    }

    /// The session a finishing request belongs to, unless it was superseded
    fn finish<'a>(
        sessions: &'a mut HashMap<ThreePid, Tracked>,
        threepid: &ThreePid,
        generation: u64,
        handle: &Cancelable,
    ) -> Result<&'a mut Tracked> {
        match sessions.get_mut(threepid) {
            Some(tracked) if tracked.session.generation == generation => {
                tracked.settle(handle);
                Ok(tracked)
            }
            _ => {
                debug!("🗑️ Request for {} outlived its session", threepid);
                Err(Error::Cancelled)
            }
        }
    }

    /// Ask the identity server to send a validation code. A live session for
    /// the same ThreePid is superseded: its in-flight requests are cancelled
    /// before the new session is created.
    #[instrument(level = "debug", skip(self, handle))]
    pub async fn start(&self, threepid: &ThreePid, identity_server: &str, handle: Cancelable) -> Result<()> {
        let start = Instant::now();

        let (snapshot, superseded) = {
            let mut sessions = self.sessions();
            let superseded = sessions.remove(threepid);
            if let Some(previous) = &superseded {
                if previous.session.is_live() {
                    warn!(
                        "♻️ Superseding {:?} binding of {} (generation {})",
                        previous.session.state, threepid, previous.session.generation
                    );
                    for in_flight in &previous.in_flight {
                        in_flight.cancel();
                    }
                    self.notify(threepid, BindingState::Cancelled);
                }
            }

            let generation = self.generation.fetch_add(1, Ordering::AcqRel);
            let session = BindingSession::new(threepid.clone(), identity_server, generation);
            let snapshot = Snapshot {
                generation,
                identity_server: session.identity_server.clone(),
                client_secret: session.client_secret.clone(),
                sid: None,
                send_attempt: session.send_attempt,
            };
            sessions.insert(
                threepid.clone(),
                Tracked {
                    session,
                    in_flight: vec![handle.clone()],
                },
            );
            (snapshot, superseded.is_some())
        };
        if superseded {
            self.persist(threepid);
        }

        debug!("📧 Requesting validation code for {}", threepid);
        let registration = self.register(threepid, snapshot.generation, &handle);
        let result = self
            .identity_api
            .request_token(
                &snapshot.identity_server,
                threepid,
                &snapshot.client_secret,
                snapshot.send_attempt,
            )
            .await;
        registration.disarm();

        {
            let mut sessions = self.sessions();
            let tracked = Self::finish(&mut sessions, threepid, snapshot.generation, &handle)?;

            match result {
                Ok(sid) => {
                    tracked.session.sid = Some(sid);
                    tracked.session.state = BindingState::CodeSent;
                    self.notify(threepid, BindingState::CodeSent);
                }
                Err(e) => {
                    sessions.remove(threepid);
                    error!("❌ Failed to start binding {}: {}", threepid, e);
                    return Err(e);
                }
            }
        }

        self.persist(threepid);
        info!("✅ Validation code sent for {} in {:?}", threepid, start.elapsed());
        Ok(())
    }

    /// Abandon a live session. No session is a successful no-op.
    #[instrument(level = "debug", skip(self))]
    pub fn cancel(&self, threepid: &ThreePid) -> Result<bool> {
        let mut sessions = self.sessions();
        let live = sessions
            .get(threepid)
            .map(|tracked| tracked.session.is_live())
            .unwrap_or(false);
        if !live {
            debug!("No binding in progress for {}", threepid);
            return Ok(false);
        }

        if let Some(tracked) = sessions.remove(threepid) {
            for in_flight in &tracked.in_flight {
                in_flight.cancel();
            }
        }
        self.notify(threepid, BindingState::Cancelled);
        drop(sessions);

        self.persist(threepid);
        info!("🚫 Binding of {} cancelled", threepid);
        Ok(true)
    }

    /// Ask for a fresh code on the same session
    #[instrument(level = "debug", skip(self, handle))]
    pub async fn resend(&self, threepid: &ThreePid, handle: Cancelable) -> Result<()> {
        const ALLOWED: &[BindingState] = &[BindingState::CodeSent, BindingState::Submitted];

        let snapshot = {
            let mut sessions = self.sessions();
            let snapshot = self.begin(&mut sessions, threepid, ALLOWED, &handle)?;
            if let Some(tracked) = sessions.get_mut(threepid) {
                tracked.session.send_attempt += 1;
            }
            Snapshot {
                send_attempt: snapshot.send_attempt + 1,
                ..snapshot
            }
        };

        debug!("📧 Resending code for {} (attempt {})", threepid, snapshot.send_attempt);
        let registration = self.register(threepid, snapshot.generation, &handle);
        let result = self
            .identity_api
            .request_token(
                &snapshot.identity_server,
                threepid,
                &snapshot.client_secret,
                snapshot.send_attempt,
            )
            .await;
        registration.disarm();

        {
            let mut sessions = self.sessions();
            let tracked = Self::finish(&mut sessions, threepid, snapshot.generation, &handle)?;

            match result {
                Ok(sid) => {
                    tracked.session.sid = Some(sid);
                    tracked.session.state = BindingState::CodeSent;
                    self.notify(threepid, BindingState::CodeSent);
                }
                Err(e) => {
                    warn!("❌ Resending code for {} failed: {}", threepid, e);
                    return Err(e);
                }
            }
        }

        self.persist(threepid);
        info!("✅ Validation code re-sent for {}", threepid);
        Ok(())
    }

    /// Submit the out-of-band code. A rejected code leaves the session in
    /// `CodeSent` so the user can retry or ask for a new code.
    #[instrument(level = "debug", skip(self, code, handle))]
    pub async fn submit(&self, threepid: &ThreePid, code: &str, handle: Cancelable) -> Result<()> {
        const ALLOWED: &[BindingState] = &[BindingState::CodeSent];

        let snapshot = {
            let mut sessions = self.sessions();
            self.begin(&mut sessions, threepid, ALLOWED, &handle)?
        };
        let sid = snapshot
            .sid
            .as_deref()
            .ok_or_else(|| Error::NoActiveSession(threepid.clone()))?;

        debug!("🔑 Submitting validation code for {}", threepid);
        let registration = self.register(threepid, snapshot.generation, &handle);
        let result = self
            .identity_api
            .submit_token(&snapshot.identity_server, threepid, sid, &snapshot.client_secret, code.trim())
            .await;
        registration.disarm();

        {
            let mut sessions = self.sessions();
            let tracked = Self::finish(&mut sessions, threepid, snapshot.generation, &handle)?;

            match result {
                Ok(()) => {
                    tracked.session.state = BindingState::Submitted;
                    self.notify(threepid, BindingState::Submitted);
                }
                Err(e) => {
                    warn!("❌ Code for {} rejected: {}", threepid, e);
                    return Err(e);
                }
            }
        }

        self.persist(threepid);
        info!("✅ Ownership of {} proven", threepid);
        Ok(())
    }

    /// Associate the validated ThreePid with the account on the homeserver.
    /// Only `SessionExpired` is fatal; other failures keep `Submitted`.
    #[instrument(level = "debug", skip(self, handle))]
    pub async fn finalize(&self, threepid: &ThreePid, handle: Cancelable) -> Result<()> {
        const ALLOWED: &[BindingState] = &[BindingState::Submitted];

        let start = Instant::now();
        let snapshot = {
            let mut sessions = self.sessions();
            self.begin(&mut sessions, threepid, ALLOWED, &handle)?
        };
        let sid = snapshot
            .sid
            .as_deref()
            .ok_or_else(|| Error::NoActiveSession(threepid.clone()))?;

        debug!("🔗 Binding {} on the homeserver", threepid);
        let registration = self.register(threepid, snapshot.generation, &handle);
        let result = self
            .homeserver_api
            .bind_threepid(&snapshot.identity_server, sid, &snapshot.client_secret)
            .await;
        registration.disarm();

        let outcome = {
            let mut sessions = self.sessions();
            let tracked = Self::finish(&mut sessions, threepid, snapshot.generation, &handle)?;

            match result {
                Ok(()) => {
                    tracked.session.state = BindingState::Finalized;
                    sessions.remove(threepid);
                    self.notify(threepid, BindingState::Finalized);
                    info!("🎉 {} bound in {:?}", threepid, start.elapsed());
                    Ok(())
                }
                Err(Error::SessionExpired) => {
                    tracked.session.state = BindingState::Failed;
                    self.notify(threepid, BindingState::Failed);
                    error!("❌ Validation session for {} expired before binding", threepid);
                    Err(Error::SessionExpired)
                }
                Err(e) => {
                    warn!("⚠️ Binding {} failed, session kept for retry: {}", threepid, e);
                    return Err(e);
                }
            }
        };

        self.persist(threepid);
        outcome
    }

    /// Ask the homeserver to unbind. Binding sessions are not consulted.
    #[instrument(level = "debug", skip(self))]
    pub async fn unbind(&self, threepid: &ThreePid, identity_server: &str) -> Result<()> {
        self.homeserver_api.unbind_threepid(identity_server, threepid).await?;
        info!("✂️ {} unbound", threepid);
        Ok(())
    }

    /// Cancel every request in flight on any session
    pub fn cancel_in_flight(&self) {
        let mut sessions = self.sessions();
        for tracked in sessions.values_mut() {
            for in_flight in tracked.in_flight.drain(..) {
                in_flight.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_terminal_states() {
        assert!(BindingState::Finalized.is_terminal());
        assert!(BindingState::Cancelled.is_terminal());
        assert!(BindingState::Failed.is_terminal());
        assert!(!BindingState::Requested.is_terminal());
        assert!(!BindingState::CodeSent.is_terminal());
        assert!(!BindingState::Submitted.is_terminal());
    }

    #[test]
    fn test_new_session_defaults() {
        let threepid = ThreePid::email("alice@example.com").unwrap();
        let session = BindingSession::new(threepid.clone(), "https://id.example.org", 3);

        assert_eq!(session.state, BindingState::Requested);
        assert_eq!(session.retry_count(), 0);
        assert_eq!(session.generation, 3);
        assert!(session.sid.is_none());
        assert!(session.is_live());
        assert_eq!(session.client_secret.len(), 32);
        assert!(session.client_secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_client_secrets_are_unique() {
        let threepid = ThreePid::email("alice@example.com").unwrap();
        let a = BindingSession::new(threepid.clone(), "https://id.example.org", 1);
        let b = BindingSession::new(threepid, "https://id.example.org", 2);
        assert_ne!(a.client_secret, b.client_secret);
    }
}
