// =============================================================================
// Matrixon Identity - Test Utils Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Scriptable in-process stand-ins for the identity server, the homeserver
//   and well-known discovery.
//
// =============================================================================

#![cfg(test)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use ruma::OwnedUserId;
use tokio::sync::Notify;

use crate::{
    service::identity::{
        BindingSession, Collaborators, Data, FoundThreePid, HomeserverApi, IdentityServerApi,
        MemoryData, ThreePid, WellKnownResolver,
    },
    utils::error::CodeRejection,
    Error, Result,
};

pub const VALID_CODE: &str = "123456";

/// How the fake answers a status check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    V2,
    V1Only,
    Down,
    Garbage,
}

/// A closed gate blocks the faked call until `open` is called
#[derive(Default)]
pub struct Gate {
    closed: Mutex<bool>,
    notify: Notify,
}

impl Gate {
    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    pub fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.notify.notify_waiters();
    }

    async fn pass(&self) {
        loop {
            let notified = self.notify.notified();
            if !*self.closed.lock().unwrap() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
pub struct FakeIdentityServer {
    pub statuses: Mutex<HashMap<String, ServerStatus>>,
    pub associations: Mutex<HashMap<ThreePid, OwnedUserId>>,
    pub already_bound: Mutex<Vec<ThreePid>>,
    pub expired_sids: Mutex<Vec<String>>,
    pub fail_requests: Mutex<bool>,
    pub gate: Gate,
    pub lookup_gate: Gate,
    pub request_token_calls: AtomicUsize,
    pub submit_token_calls: AtomicUsize,
    pub lookup_calls: AtomicUsize,
    pub send_attempts: Mutex<Vec<u32>>,
    pub lookup_servers: Mutex<Vec<String>>,
}

impl FakeIdentityServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_status(&self, base_url: &str, status: ServerStatus) {
        self.statuses.lock().unwrap().insert(base_url.to_owned(), status);
    }

    pub fn associate(&self, threepid: &ThreePid, user_id: &str) {
        self.associations
            .lock()
            .unwrap()
            .insert(threepid.clone(), ruma::UserId::parse(user_id).unwrap());
    }

    pub fn expire(&self, sid: &str) {
        self.expired_sids.lock().unwrap().push(sid.to_owned());
    }
}

#[async_trait]
impl IdentityServerApi for FakeIdentityServer {
    async fn status(&self, base_url: &str) -> Result<()> {
        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(base_url)
            .copied()
            .unwrap_or(ServerStatus::V2);
        match status {
            ServerStatus::V2 => Ok(()),
            ServerStatus::V1Only => Err(Error::UnsupportedServerVersion(format!("{base_url} only speaks v1"))),
            ServerStatus::Down => Err(Error::Unreachable(format!("{base_url} refused connection"))),
            ServerStatus::Garbage => Err(Error::MalformedResponse("expected JSON".to_string())),
        }
    }

    async fn request_token(
        &self,
        _base_url: &str,
        threepid: &ThreePid,
        client_secret: &str,
        send_attempt: u32,
    ) -> Result<String> {
        let call = self.request_token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.send_attempts.lock().unwrap().push(send_attempt);
        self.gate.pass().await;

        if *self.fail_requests.lock().unwrap() {
            return Err(Error::Unreachable("identity server went away".to_string()));
        }
        if self.already_bound.lock().unwrap().contains(threepid) {
            return Err(Error::AlreadyBound);
        }
        Ok(format!("sid-{}-{}", &client_secret[..8], call))
    }

    async fn submit_token(
        &self,
        _base_url: &str,
        _threepid: &ThreePid,
        sid: &str,
        _client_secret: &str,
        token: &str,
    ) -> Result<()> {
        self.submit_token_calls.fetch_add(1, Ordering::SeqCst);
        if self.expired_sids.lock().unwrap().iter().any(|expired| expired == sid) {
            return Err(Error::InvalidOrExpiredCode(CodeRejection::ExpiredSession));
        }
        if token != VALID_CODE {
            return Err(Error::InvalidOrExpiredCode(CodeRejection::InvalidCode));
        }
        Ok(())
    }

    async fn lookup(&self, base_url: &str, threepids: &[ThreePid]) -> Result<Vec<FoundThreePid>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup_servers.lock().unwrap().push(base_url.to_owned());
        self.lookup_gate.pass().await;
        let associations = self.associations.lock().unwrap();
        Ok(threepids
            .iter()
            .filter_map(|threepid| {
                associations.get(threepid).map(|user_id| FoundThreePid {
                    threepid: threepid.clone(),
                    user_id: user_id.clone(),
                })
            })
            .collect())
    }
}

/// Outcome the fake homeserver gives for the next bind call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Ok,
    Down,
    Expired,
}

#[derive(Default)]
pub struct FakeHomeserver {
    pub bind_outcomes: Mutex<VecDeque<BindOutcome>>,
    pub bind_calls: AtomicUsize,
    pub unbind_calls: Mutex<Vec<(String, ThreePid)>>,
}

impl FakeHomeserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn next_bind(&self, outcome: BindOutcome) {
        self.bind_outcomes.lock().unwrap().push_back(outcome);
    }
}

#[async_trait]
impl HomeserverApi for FakeHomeserver {
    async fn bind_threepid(&self, _identity_server: &str, _sid: &str, _client_secret: &str) -> Result<()> {
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .bind_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BindOutcome::Ok);
        match outcome {
            BindOutcome::Ok => Ok(()),
            BindOutcome::Down => Err(Error::Unreachable("homeserver timed out".to_string())),
            BindOutcome::Expired => Err(Error::SessionExpired),
        }
    }

    async fn unbind_threepid(&self, identity_server: &str, threepid: &ThreePid) -> Result<()> {
        self.unbind_calls
            .lock()
            .unwrap()
            .push((identity_server.to_owned(), threepid.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeWellKnown {
    pub advertised: Mutex<Option<String>>,
    pub down: Mutex<bool>,
}

impl FakeWellKnown {
    pub fn advertising(url: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            advertised: Mutex::new(url.map(str::to_owned)),
            down: Mutex::new(false),
        })
    }
}

#[async_trait]
impl WellKnownResolver for FakeWellKnown {
    async fn identity_server(&self) -> Result<Option<String>> {
        if *self.down.lock().unwrap() {
            return Err(Error::Unreachable("well-known lookup failed".to_string()));
        }
        Ok(self.advertised.lock().unwrap().clone())
    }
}

/// In-memory store whose binding writes can be made to fail or stall
#[derive(Default)]
pub struct FlakyData {
    inner: MemoryData,
    pub fail_writes: AtomicBool,
    /// How long each binding write blocks the calling thread
    pub write_delay: Mutex<Option<Duration>>,
    pub writing: AtomicBool,
}

impl FlakyData {
    fn write(&self, op: impl FnOnce(&MemoryData) -> Result<()>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".to_string()));
        }
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            self.writing.store(true, Ordering::SeqCst);
            std::thread::sleep(delay);
            self.writing.store(false, Ordering::SeqCst);
        }
        op(&self.inner)
    }
}

impl Data for FlakyData {
    fn identity_server_url(&self) -> Result<Option<String>> {
        self.inner.identity_server_url()
    }

    fn set_identity_server_url(&self, url: Option<&str>) -> Result<()> {
        self.inner.set_identity_server_url(url)
    }

    fn save_pending_binding(&self, session: &BindingSession) -> Result<()> {
        self.write(|inner| inner.save_pending_binding(session))
    }

    fn delete_pending_binding(&self, threepid: &ThreePid) -> Result<()> {
        self.write(|inner| inner.delete_pending_binding(threepid))
    }

    fn pending_bindings(&self) -> Result<Vec<BindingSession>> {
        self.inner.pending_bindings()
    }
}

/// Fakes wired together, keeping typed handles for assertions
pub struct Harness {
    pub identity: Arc<FakeIdentityServer>,
    pub homeserver: Arc<FakeHomeserver>,
    pub well_known: Arc<FakeWellKnown>,
    pub data: Arc<FlakyData>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            identity: FakeIdentityServer::new(),
            homeserver: FakeHomeserver::new(),
            well_known: FakeWellKnown::advertising(Some("https://vector.im")),
            data: Arc::new(FlakyData::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            identity_api: self.identity.clone(),
            homeserver_api: self.homeserver.clone(),
            well_known: self.well_known.clone(),
            data: self.data.clone(),
        }
    }
}
