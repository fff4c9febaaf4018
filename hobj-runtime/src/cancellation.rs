//! Cooperative Cancellation
//!
//! Cancellation tokens let one thread abandon another thread's blocked queue
//! operation without tearing the queue down.
//!
//! # Design
//!
//! Cancellation is cooperative. A blocked call registers a wake callback on
//! the token with [`CancellationToken::on_cancel`] before it starts waiting,
//! and re-checks [`CancellationToken::is_cancelled`] each time it wakes.
//! Cancelling runs every registered callback on the cancelling thread, after
//! the token's own locks have been released. A callback therefore may take
//! other locks, such as the mutex of the queue it wakes.
//!
//! Callbacks are never invoked from inside `on_cancel`, even for a token that
//! is already cancelled. Callers register first and check second.
//!
//! Tokens form a hierarchy: a child is cancelled when it or any ancestor is.
//! A callback registered on a child fires for either.
//!
//! # Example
//!
//! ```rust,ignore
//! use hobj_runtime::cancellation::CancellationSource;
//!
//! let source = CancellationSource::new();
//! let token = source.token();
//!
//! std::thread::spawn(move || {
//!     let _ = queue.dequeue_cancellable(Timeout::Forever, &token);
//! });
//!
//! source.cancel();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::timeout::Timeout;

/// Counter for generating unique token and callback IDs.
static TOKEN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Shared state behind a token.
struct CancellationState {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
    reason: Mutex<Option<String>>,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    notify: (Mutex<()>, Condvar),
}

impl CancellationState {
    fn new(parent: Option<CancellationToken>) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            parent,
            reason: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            notify: (Mutex::new(()), Condvar::new()),
        }
    }
}

impl fmt::Debug for CancellationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationState")
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("callbacks", &self.callbacks.lock().len())
            .finish()
    }
}

/// A read-only view of a cancellation flag.
///
/// Tokens are created by [`CancellationSource`] and are cheap to clone.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    id: u64,
    state: Arc<CancellationState>,
}

impl CancellationToken {
    fn with_state(parent: Option<CancellationToken>) -> Self {
        Self {
            id: TOKEN_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(CancellationState::new(parent)),
        }
    }

    /// Unique token ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if cancellation has been requested on this token or an ancestor.
    pub fn is_cancelled(&self) -> bool {
        if self.state.cancelled.load(Ordering::Acquire) {
            return true;
        }
        self.state.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// The cancellation reason, taken from the nearest cancelled ancestor.
    pub fn reason(&self) -> Option<String> {
        if self.state.cancelled.load(Ordering::Acquire) {
            return self.state.reason.lock().clone();
        }
        self.state.parent.as_ref().and_then(|p| p.reason())
    }

    /// Return an error if cancellation has been requested.
    pub fn check(&self) -> Result<(), CancellationError> {
        if self.is_cancelled() {
            Err(CancellationError {
                reason: self.reason(),
            })
        } else {
            Ok(())
        }
    }

    /// Create a child token, cancelled whenever this token is.
    pub fn child(&self) -> CancellationToken {
        CancellationToken::with_state(Some(self.clone()))
    }

    /// Register `callback` to run when this token or any ancestor is cancelled.
    ///
    /// The callback runs at most once per cancelling source. It stays
    /// registered until the returned [`CancelRegistration`] is dropped.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = TOKEN_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Arc::new(callback);
        let mut entries = Vec::new();
        let mut token = Some(self);
        while let Some(t) = token {
            t.state.callbacks.lock().push((id, Arc::clone(&callback)));
            entries.push(Arc::downgrade(&t.state));
            token = t.state.parent.as_ref();
        }
        CancelRegistration { id, entries }
    }

    /// Block until cancelled or until `timeout` elapses.
    ///
    /// Returns `true` if the token was cancelled.
    pub fn wait(&self, timeout: impl Into<Timeout>) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let deadline = timeout.into().deadline();
        let state = Arc::downgrade(&self.state);
        let _registration = self.on_cancel(move || {
            if let Some(state) = state.upgrade() {
                let (lock, cvar) = &state.notify;
                let _guard = lock.lock();
                cvar.notify_all();
            }
        });

        let (lock, cvar) = &self.state.notify;
        let mut guard = lock.lock();
        while !self.is_cancelled() {
            match deadline.instant() {
                None => cvar.wait(&mut guard),
                Some(at) => {
                    if cvar.wait_until(&mut guard, at).timed_out() {
                        return self.is_cancelled();
                    }
                }
            }
        }
        true
    }

    /// Block for at most `duration`; shorthand for [`CancellationToken::wait`].
    pub fn wait_for(&self, duration: Duration) -> bool {
        self.wait(Timeout::from(duration))
    }
}

/// A token that is never cancelled.
static NONE_TOKEN: OnceLock<CancellationToken> = OnceLock::new();

impl Default for CancellationToken {
    /// Returns a token that is never cancelled.
    fn default() -> Self {
        NONE_TOKEN
            .get_or_init(|| CancellationToken::with_state(None))
            .clone()
    }
}

/// Keeps a cancellation callback registered; dropping it unregisters.
#[must_use = "the callback is unregistered when this is dropped"]
#[derive(Debug)]
pub struct CancelRegistration {
    id: u64,
    entries: Vec<Weak<CancellationState>>,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        for state in self.entries.drain(..).filter_map(|w| w.upgrade()) {
            state.callbacks.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// The owning side of a cancellation token.
#[derive(Debug)]
pub struct CancellationSource {
    token: CancellationToken,
}

impl CancellationSource {
    /// Create a new cancellation source.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::with_state(None),
        }
    }

    /// Create a source whose tokens are also cancelled by `parent`.
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            token: CancellationToken::with_state(Some(parent)),
        }
    }

    /// A token observing this source.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel all tokens from this source.
    pub fn cancel(&self) {
        self.cancel_with_reason(None);
    }

    /// Cancel all tokens, recording a reason.
    ///
    /// Cancelling twice keeps the first reason and runs no callbacks.
    pub fn cancel_with_reason(&self, reason: Option<String>) {
        let state = &self.token.state;
        {
            let mut r = state.reason.lock();
            if state.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            *r = reason;
        }
        tracing::trace!(token = self.token.id, "cancellation requested");

        let callbacks: Vec<Callback> = state
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation cancelled{}", suffix(.reason))]
pub struct CancellationError {
    /// The cancellation reason, if provided.
    pub reason: Option<String>,
}

fn suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}
