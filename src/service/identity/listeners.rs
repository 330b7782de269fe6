// =============================================================================
// Matrixon Identity - Listener Registry Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Observers of identity server changes and binding transitions. Emitting
//   only enqueues; a dedicated task fans events out to the registered
//   listeners, so the emitter is never blocked by a slow observer.
//
// =============================================================================

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{BindingState, ThreePid};

/// Observer of identity service state changes
pub trait IdentityServiceListener: Send + Sync {
    fn on_identity_server_change(&self, _url: Option<&str>) {}

    fn on_binding_state_change(&self, _threepid: &ThreePid, _state: BindingState) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    IdentityServerChanged { url: Option<String> },
    BindingStateChanged { threepid: ThreePid, state: BindingState },
}

type Listeners = Arc<RwLock<Vec<Arc<dyn IdentityServiceListener>>>>;

pub struct ListenerRegistry {
    listeners: Listeners,
    queue: Mutex<Option<mpsc::UnboundedSender<IdentityEvent>>>,
    event_tx: broadcast::Sender<IdentityEvent>,
}

/// Listeners are identified by the address of their shared allocation
fn same_listener(a: &Arc<dyn IdentityServiceListener>, b: &Arc<dyn IdentityServiceListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl ListenerRegistry {
    /// Starts the delivery task. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<IdentityEvent>();
        let (event_tx, _) = broadcast::channel(256);

        let worker_listeners = Arc::clone(&listeners);
        tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                let snapshot: Vec<Arc<dyn IdentityServiceListener>> = match worker_listeners.read() {
                    Ok(listeners) => listeners.clone(),
                    Err(_) => {
                        warn!("⚠️ Listener registry poisoned, dropping {:?}", event);
                        continue;
                    }
                };

                debug!("📣 Delivering {:?} to {} listeners", event, snapshot.len());
                for listener in snapshot {
                    match &event {
                        IdentityEvent::IdentityServerChanged { url } => {
                            listener.on_identity_server_change(url.as_deref())
                        }
                        IdentityEvent::BindingStateChanged { threepid, state } => {
                            listener.on_binding_state_change(threepid, *state)
                        }
                    }
                }
            }
            debug!("🛑 Listener delivery task stopped");
        });

        Self {
            listeners,
            queue: Mutex::new(Some(queue_tx)),
            event_tx,
        }
    }

    /// Adding the same listener twice keeps a single registration
    pub fn add(&self, listener: Arc<dyn IdentityServiceListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            if !listeners.iter().any(|existing| same_listener(existing, &listener)) {
                listeners.push(listener);
            }
        }
    }

    pub fn remove(&self, listener: &Arc<dyn IdentityServiceListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|existing| !same_listener(existing, listener));
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|listeners| listeners.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue an event. Callers emit only after the change is recorded.
    pub fn emit(&self, event: IdentityEvent) {
        let _ = self.event_tx.send(event.clone());
        match self.queue.lock() {
            Ok(queue) => match queue.as_ref() {
                Some(queue) => {
                    if queue.send(event).is_err() {
                        warn!("⚠️ Listener delivery task is gone");
                    }
                }
                None => debug!("Registry closed, dropping {:?}", event),
            },
            Err(_) => warn!("⚠️ Listener queue poisoned"),
        }
    }

    /// Channel view of the same events, for consumers that prefer polling
    pub fn subscribe_events(&self) -> broadcast::Receiver<IdentityEvent> {
        self.event_tx.subscribe()
    }

    /// Stop accepting events. Already queued events are still delivered.
    pub fn close(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
    }
}
