// =============================================================================
// Matrixon Identity - Identity Service Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Client side of the identity service: which identity server is in use,
//   the ThreePid binding workflow, lookups and share status. Every network
//   operation returns a `Pending` immediately and settles exactly once.
//
// =============================================================================

pub mod api;
mod binding;
mod data;
mod dispatcher;
mod listeners;
mod locator;
mod lookup;
mod share_status;
mod threepid;


pub use api::{HomeserverApi, IdentityServerApi, WellKnownResolver};
pub use binding::{BindingSession, BindingState, ThreePidBindingTracker};
pub use data::{Data, MemoryData};
pub use dispatcher::{Cancelable, Pending, RequestDispatcher};
pub use listeners::{IdentityEvent, IdentityServiceListener, ListenerRegistry};
pub use locator::{normalize_url, server_host, IdentityServerConfig, ServerLocator, ValidationStatus};
pub use lookup::LookupClient;
pub use share_status::{ShareStatusAggregator, SharedState};
pub use threepid::{FoundThreePid, ThreePid};

use std::{collections::HashMap, sync::Arc};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{Error, Result};

/// Everything the identity service talks to
#[derive(Clone)]
pub struct Collaborators {
    pub identity_api: Arc<dyn IdentityServerApi>,
    pub homeserver_api: Arc<dyn HomeserverApi>,
    pub well_known: Arc<dyn WellKnownResolver>,
    pub data: Arc<dyn Data>,
}

pub struct Service {
    dispatcher: RequestDispatcher,
    locator: Arc<ServerLocator>,
    tracker: Arc<ThreePidBindingTracker>,
    lookup: Arc<LookupClient>,
    share_status: Arc<ShareStatusAggregator>,
    listeners: Arc<ListenerRegistry>,
}

impl Service {
    /// Build the service and restore persisted state. Must be called from
    /// within a tokio runtime.
    pub fn new(collaborators: Collaborators, max_concurrent_requests: usize) -> Result<Self> {
        let Collaborators {
            identity_api,
            homeserver_api,
            well_known,
            data,
        } = collaborators;

        let listeners = Arc::new(ListenerRegistry::new());
        let locator = Arc::new(ServerLocator::new(
            Arc::clone(&identity_api),
            well_known,
            Arc::clone(&data),
            Arc::clone(&listeners),
        )?);
        let tracker = Arc::new(ThreePidBindingTracker::new(
            Arc::clone(&identity_api),
            homeserver_api,
            data,
            Arc::clone(&listeners),
        ));
        tracker.restore()?;
        let lookup = Arc::new(LookupClient::new(identity_api));
        let share_status = Arc::new(ShareStatusAggregator::new(Arc::clone(&lookup), Arc::clone(&tracker)));

        info!(
            "🆔 Identity service ready (identity server: {:?})",
            locator.current()
        );

        Ok(Self {
            dispatcher: RequestDispatcher::new(max_concurrent_requests),
            locator,
            tracker,
            lookup,
            share_status,
            listeners,
        })
    }

    fn identity_server(&self) -> Result<String> {
        self.locator.require_current()
    }

    /// Identity server advertised by the homeserver's well-known document.
    /// May differ from the one currently in use.
    pub fn get_default_identity_server(&self) -> Pending<Option<String>> {
        let locator = Arc::clone(&self.locator);
        self.dispatcher.dispatch("well_known", move |_| async move {
            locator.default_identity_server().await
        })
    }

    pub fn get_current_identity_server(&self) -> Option<String> {
        self.locator.current()
    }

    pub fn identity_server_config(&self) -> Arc<IdentityServerConfig> {
        self.locator.snapshot()
    }

    /// Status check; only identity service API v2 is accepted
    pub fn is_valid_identity_server(&self, url: &str) -> Pending<()> {
        let locator = Arc::clone(&self.locator);
        let url = url.to_owned();
        self.dispatcher.dispatch("status", move |_| async move {
            let result = locator.check(&url).await;
            if let Ok(normalized) = normalize_url(&url) {
                locator.record_validation(&normalized, &result);
            }
            result.map(|_| ())
        })
    }

    /// `None` disconnects. On success yields the url actually stored.
    pub fn set_new_identity_server(&self, url: Option<&str>) -> Pending<Option<String>> {
        let locator = Arc::clone(&self.locator);
        let url = url.map(str::to_owned);
        self.dispatcher.dispatch("set_identity_server", move |_| async move {
            locator.set_identity_server(url.as_deref()).await
        })
    }

    pub fn start_bind_threepid(&self, threepid: ThreePid) -> Pending<()> {
        let tracker = Arc::clone(&self.tracker);
        let server = self.identity_server();
        self.dispatcher.dispatch("start_bind", move |handle| async move {
            tracker.start(&threepid, &server?, handle).await
        })
    }

    pub fn cancel_bind_threepid(&self, threepid: ThreePid) -> Pending<()> {
        let tracker = Arc::clone(&self.tracker);
        self.dispatcher.dispatch("cancel_bind", move |_| async move {
            tracker.cancel(&threepid).map(|_| ())
        })
    }

    pub fn send_again_validation_code(&self, threepid: ThreePid) -> Pending<()> {
        let tracker = Arc::clone(&self.tracker);
        self.dispatcher.dispatch("resend_code", move |handle| async move {
            tracker.resend(&threepid, handle).await
        })
    }

    /// Submit the code the identity server sent by email or SMS. Success
    /// still requires `finalize_bind_threepid`.
    pub fn submit_validation_token(&self, threepid: ThreePid, code: &str) -> Pending<()> {
        let tracker = Arc::clone(&self.tracker);
        let code = code.to_owned();
        self.dispatcher.dispatch("submit_code", move |handle| async move {
            if code.trim().is_empty() {
                return Err(Error::InvalidInput("validation code is empty".to_string()));
            }
            tracker.submit(&threepid, &code, handle).await
        })
    }

    pub fn finalize_bind_threepid(&self, threepid: ThreePid) -> Pending<()> {
        let tracker = Arc::clone(&self.tracker);
        self.dispatcher.dispatch("finalize_bind", move |handle| async move {
            tracker.finalize(&threepid, handle).await
        })
    }

    /// Performed by the homeserver, whatever the local binding state
    pub fn unbind_threepid(&self, threepid: ThreePid) -> Pending<()> {
        let tracker = Arc::clone(&self.tracker);
        let server = self.identity_server();
        self.dispatcher.dispatch("unbind", move |_| async move {
            tracker.unbind(&threepid, &server?).await
        })
    }

    pub fn look_up(&self, threepids: Vec<ThreePid>) -> Pending<Vec<FoundThreePid>> {
        let lookup = Arc::clone(&self.lookup);
        let server = self.identity_server();
        self.dispatcher.dispatch("lookup", move |_| async move {
            if threepids.is_empty() {
                return Ok(Vec::new());
            }
            lookup.look_up(&server?, &threepids).await
        })
    }

    /// Share status of the user's own ThreePids: one lookup for the whole
    /// batch, completed with local binding state.
    pub fn get_share_status(&self, threepids: Vec<ThreePid>) -> Pending<HashMap<ThreePid, SharedState>> {
        let share_status = Arc::clone(&self.share_status);
        let server = self.identity_server();
        self.dispatcher.dispatch("share_status", move |_| async move {
            if threepids.is_empty() {
                return Ok(HashMap::new());
            }
            share_status.share_status(&server?, &threepids).await
        })
    }

    pub fn binding_state(&self, threepid: &ThreePid) -> Option<BindingState> {
        self.tracker.state(threepid)
    }

    /// Live sessions, including ones restored from storage
    pub fn pending_bindings(&self) -> Vec<BindingSession> {
        self.tracker.pending_sessions()
    }

    pub fn add_listener(&self, listener: Arc<dyn IdentityServiceListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn IdentityServiceListener>) {
        self.listeners.remove(listener);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<IdentityEvent> {
        self.listeners.subscribe_events()
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Cancel all outstanding work and stop notifying listeners
    pub fn shutdown(&self) {
        debug!("🛑 Shutting down identity service");
        self.tracker.cancel_in_flight();
        self.dispatcher.shutdown();
        self.listeners.close();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.listeners.close();
    }
}
