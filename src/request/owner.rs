//! Request Owner
//!
//! Scope object for one logical batch of cache requests: it carries the
//! priority, the cooperative cancel signal, and the count of elements whose
//! callbacks have not fired yet.
//!
//! # State machine
//!
//! ```text
//! Open ──wait()/wait_async()──▶ Draining ──(pending == 0)──▶ Closed
//! ```
//!
//! Elements submitted to a `Closed` owner complete immediately with
//! [`Status::Canceled`](super::Status::Canceled).

use std::future::Future;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Scheduling priority of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    /// Used by synchronous call sites that block on [`RequestOwner::wait`]
    Blocking,
}

impl Priority {
    /// Maximum number of elements of one owner running at the same time
    pub fn max_in_flight(self) -> Option<usize> {
        match self {
            Priority::Lowest => Some(1),
            Priority::Low => Some(4),
            Priority::Normal => Some(16),
            Priority::High => Some(64),
            Priority::Highest | Priority::Blocking => None,
        }
    }
}

/// Lifecycle of an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    Open,
    Draining,
    Closed,
}

struct Pending {
    count: usize,
    state: OwnerState,
}

struct Inner {
    priority: Priority,
    runtime: Handle,
    cancel: CancellationToken,
    limiter: Option<Arc<Semaphore>>,
    pending: Mutex<Pending>,
    drained: Condvar,
    notify: Notify,
}

/// Groups a batch of asynchronous cache requests for joint waiting and
/// cancellation. Cheap to clone; clones share one scope.
#[derive(Clone)]
pub struct RequestOwner {
    inner: Arc<Inner>,
}

impl RequestOwner {
    /// Create an owner that runs its requests on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime; use
    /// [`RequestOwner::with_runtime`] from plain threads.
    pub fn new(priority: Priority) -> Self {
        Self::with_runtime(Handle::current(), priority)
    }

    /// Create an owner that runs its requests on `runtime`
    pub fn with_runtime(runtime: Handle, priority: Priority) -> Self {
        Self {
            inner: Arc::new(Inner {
                priority,
                runtime,
                cancel: CancellationToken::new(),
                limiter: priority
                    .max_in_flight()
                    .map(|permits| Arc::new(Semaphore::new(permits))),
                pending: Mutex::new(Pending {
                    count: 0,
                    state: OwnerState::Open,
                }),
                drained: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Get the priority
    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> OwnerState {
        self.inner.pending.lock().state
    }

    /// Number of submitted elements whose callback has not fired
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().count
    }

    /// Signal cancellation. Elements not yet started complete with
    /// `Canceled`; running elements finish normally.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether [`RequestOwner::cancel`] was called
    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Block the calling thread until every submitted element has completed.
    ///
    /// Must not be called from a Tokio worker thread; async callers use
    /// [`RequestOwner::wait_async`].
    pub fn wait(&self) {
        let mut pending = self.inner.pending.lock();
        pending.state = OwnerState::Draining;
        while pending.count > 0 {
            self.inner.drained.wait(&mut pending);
        }
        pending.state = OwnerState::Closed;
    }

    /// Wait without blocking the thread until every submitted element has
    /// completed.
    pub async fn wait_async(&self) {
        self.set_state(OwnerState::Draining);
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                break;
            }
            notified.await;
        }
        self.set_state(OwnerState::Closed);
    }

    fn set_state(&self, state: OwnerState) {
        self.inner.pending.lock().state = state;
    }

    // =========================================================================
    // Dispatcher hooks
    // =========================================================================

    /// Account for one element. `None` once the owner is closed.
    pub(crate) fn track(&self) -> Option<PendingGuard> {
        let mut pending = self.inner.pending.lock();
        if pending.state == OwnerState::Closed {
            return None;
        }
        pending.count += 1;
        Some(PendingGuard {
            inner: self.inner.clone(),
        })
    }

    /// Wait for an in-flight slot. `None` when canceled first.
    pub(crate) async fn admit(&self) -> Option<Admission> {
        let Some(limiter) = self.inner.limiter.clone() else {
            return (!self.is_canceled()).then_some(Admission(None));
        };
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => None,
            permit = limiter.acquire_owned() => permit.ok().map(|p| Admission(Some(p))),
        }
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.runtime.spawn(task);
    }
}

impl std::fmt::Debug for RequestOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.inner.pending.lock();
        f.debug_struct("RequestOwner")
            .field("priority", &self.inner.priority)
            .field("state", &pending.state)
            .field("pending", &pending.count)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Held by a running element; releasing it marks the element complete
pub(crate) struct PendingGuard {
    inner: Arc<Inner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock();
        pending.count -= 1;
        if pending.count == 0 {
            self.inner.drained.notify_all();
            self.inner.notify.notify_waiters();
        }
    }
}

/// In-flight slot for one element
pub(crate) struct Admission(#[allow(dead_code)] Option<OwnedSemaphorePermit>);

// =============================================================================
// Tests
// =============================================================================
