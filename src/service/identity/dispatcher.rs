// =============================================================================
// Matrixon Identity - Request Dispatcher Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Single choke point for outbound identity work. Every operation is spawned
//   onto the tokio runtime and handed back to the caller as a `Pending` value
//   owning a `Cancelable`. Cancellation is a flag checked before delivery;
//   aborting the underlying task is best effort.
//
// =============================================================================

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Instant,
};

use tokio::{
    sync::{oneshot, Semaphore},
    task::AbortHandle,
};
use tracing::{debug, warn};

use crate::{Error, Result};

const RUNNING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

struct CancelState {
    id: u64,
    state: AtomicU8,
    abort: Mutex<Option<AbortHandle>>,
}

/// Handle on one in-flight request.
///
/// `cancel` may be called any number of times, before or after completion;
/// only the first call before completion has an effect.
#[derive(Clone)]
pub struct Cancelable {
    inner: Arc<CancelState>,
}

impl Cancelable {
    fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(CancelState {
                id,
                state: AtomicU8::new(RUNNING),
                abort: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn cancel(&self) {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        debug!("🛑 Request #{} cancelled", self.inner.id);
        if let Some(abort) = self.lock_abort().take() {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == COMPLETED
    }

    /// Claims the right to deliver a result. Fails once cancelled.
    fn complete(&self) -> bool {
        self.inner
            .state
            .compare_exchange(RUNNING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn attach(&self, abort: AbortHandle) {
        let mut slot = self.lock_abort();
        if self.is_cancelled() {
            abort.abort();
        } else if !self.is_completed() {
            *slot = Some(abort);
        }
    }

    fn lock_abort(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        // A poisoned slot only ever holds an abort handle
        self.inner.abort.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Cancelable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancelable")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Result of a dispatched operation.
///
/// Awaiting yields the operation's result, or `Error::Cancelled` when the
/// handle was cancelled before the result was delivered.
pub struct Pending<T> {
    handle: Cancelable,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub fn handle(&self) -> Cancelable {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<T: Send + 'static> Pending<T> {
    /// Callback-style continuation. The callback runs at most once and never
    /// after the returned handle has been cancelled.
    pub fn then<F>(self, callback: F) -> Cancelable
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let Pending { handle, rx } = self;
        tokio::spawn(async move {
            if let Ok(result) = rx.await {
                callback(result);
            }
        });
        handle
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

type InFlight = Arc<Mutex<HashMap<u64, Cancelable>>>;

struct InFlightGuard {
    id: u64,
    in_flight: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.id);
        }
    }
}

/// Spawns identity operations and tracks them until they settle
pub struct RequestDispatcher {
    next_id: AtomicU64,
    in_flight: InFlight,
    permits: Arc<Semaphore>,
}

impl RequestDispatcher {
    pub fn new(max_concurrent_requests: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
        }
    }

    /// Spawn `op` and return immediately. The operation receives its own
    /// handle so it can register it with whatever it supersedes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch<T, F, Fut>(&self, name: &'static str, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Cancelable) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Cancelable::new(id);
        let (tx, rx) = oneshot::channel();
        let work = op(handle.clone());

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.insert(id, handle.clone());
        }

        let guard = InFlightGuard {
            id,
            in_flight: Arc::clone(&self.in_flight),
        };
        let permits = Arc::clone(&self.permits);
        let task_handle = handle.clone();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let start = Instant::now();
            debug!("📤 Dispatching {} request #{}", name, id);

            let result = match permits.acquire_owned().await {
                Ok(_permit) => work.await,
                Err(_) => Err(Error::Cancelled),
            };

            if task_handle.complete() {
                debug!("✅ {} request #{} settled in {:?}", name, id, start.elapsed());
                let _ = tx.send(result);
            } else {
                warn!("🗑️ Discarding result of cancelled {} request #{}", name, id);
            }
        });

        handle.attach(task.abort_handle());
        Pending { handle, rx }
    }

    /// Number of requests spawned and not yet settled
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|in_flight| in_flight.len()).unwrap_or(0)
    }

    /// Cancel everything in flight and refuse new work
    pub fn shutdown(&self) {
        self.permits.close();
        let handles: Vec<Cancelable> = match self.in_flight.lock() {
            Ok(mut in_flight) => in_flight.drain().map(|(_, handle)| handle).collect(),
            Err(_) => Vec::new(),
        };

        debug!("🛑 Cancelling {} in-flight requests", handles.len());
        for handle in handles {
            handle.cancel();
        }
    }
}
