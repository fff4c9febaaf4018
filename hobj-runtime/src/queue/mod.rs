//! # Synchronized Queue
//!
//! A bounded or unbounded blocking queue that lives in a [`Registry`] and is
//! shared between threads by handle.
//!
//! ## Design
//!
//! Each queue owns one `parking_lot::Mutex` over a resizable ring buffer and
//! two condition variables:
//! - `cond` wakes producers blocked on a full queue and consumers blocked on
//!   an empty one. Every wakeup is a broadcast; each woken thread re-checks
//!   its own predicate.
//! - `drained` wakes threads blocked in shutdown.
//!
//! The buffer starts at [`INLINE_CAPACITY`] slots (or the floor of a
//! [`Limit::Minimum`]), doubles when full and halves once occupancy drops below
//! a quarter, never going under its floor.
//!
//! ## Lifecycle
//!
//! ```text
//!   create ──▶ ACTIVE ──shutdown──▶ DRAINING ──empty, no waiters──▶ released
//!                                                                     │
//!                                         last Ref dropped ◀──────────┘
//! ```
//!
//! Draining refuses enqueues but keeps serving dequeues until the buffer is
//! empty. Once it is empty and no thread is blocked in the queue, shutdown
//! releases the creation reference; the queue is destroyed when the last
//! outstanding reference goes away, and leftover items are handed to the
//! destroyer.
//!
//! # Example
//!
//! ```rust,ignore
//! use hobj_runtime::queue::{End, Limit, QueueHandle};
//! use hobj_runtime::{Registry, Timeout};
//!
//! let registry = Registry::new();
//! let queue = QueueHandle::<String>::create(&registry, Limit::Max(16))?;
//!
//! queue.enqueue("job".to_string(), Timeout::Forever, End::Back)?;
//! let job = queue.dequeue(Timeout::After(Duration::from_secs(1)))?;
//!
//! queue.shutdown(Timeout::Forever)?;
//! ```

mod ring;

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cancellation::{CancelRegistration, CancellationToken};
use crate::object::{Class, Handle, TypeTag};
use crate::registry::{Ref, Registry, RegistryError};
use crate::timeout::{Deadline, Timeout};

use self::ring::Ring;

/// Smallest buffer a queue ever holds.
pub const INLINE_CAPACITY: usize = 8;

// ============================================================================
// Limits and Errors
// ============================================================================

/// Capacity policy of a queue.
///
/// The raw encoding used at the C boundary is a signed integer: `0` is
/// unbounded, a negative value is a capacity floor and a positive value is a
/// hard cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Limit {
    /// Grow without bound.
    #[default]
    Unbounded,
    /// Grow without bound, never shrink below this many slots.
    Minimum(usize),
    /// Hold at most this many items; enqueue blocks when full.
    Max(usize),
}

impl Limit {
    /// Decode the signed encoding.
    pub fn from_raw(raw: i64) -> Self {
        let n = usize::try_from(raw.unsigned_abs()).unwrap_or(usize::MAX);
        match raw {
            0 => Limit::Unbounded,
            r if r < 0 => Limit::Minimum(n),
            _ => Limit::Max(n),
        }
    }

    /// Encode as a signed integer, saturating.
    pub fn into_raw(self) -> i64 {
        let clamp = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
        match self {
            Limit::Unbounded => 0,
            Limit::Minimum(n) => -clamp(n),
            Limit::Max(n) => clamp(n),
        }
    }

    fn floor(&self) -> usize {
        match self {
            Limit::Minimum(n) => (*n).max(INLINE_CAPACITY),
            _ => INLINE_CAPACITY,
        }
    }
}

impl From<i64> for Limit {
    fn from(raw: i64) -> Self {
        Limit::from_raw(raw)
    }
}

/// Errors returned by queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The handle is unknown, stale or not a queue of this item type.
    #[error("invalid queue handle")]
    Invalid,
    /// The deadline passed before the operation could complete.
    #[error("timed out waiting on queue")]
    Timeout,
    /// The queue is draining.
    #[error("queue is shutting down")]
    Shutdown,
    /// The buffer could not grow.
    #[error("queue buffer allocation failed")]
    AllocFailed,
    /// The cancellation token fired.
    #[error("queue operation cancelled")]
    Cancelled,
}

/// A failed enqueue, carrying the rejected item.
#[derive(Clone, PartialEq, Eq)]
pub enum EnqueueError<T> {
    /// The handle is unknown, stale or not a queue of this item type.
    Invalid(T),
    /// The queue stayed full until the deadline.
    Timeout(T),
    /// The queue is draining.
    Shutdown(T),
    /// The buffer could not grow.
    AllocFailed(T),
    /// The cancellation token fired.
    Cancelled(T),
}

impl<T> EnqueueError<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Invalid(v)
            | EnqueueError::Timeout(v)
            | EnqueueError::Shutdown(v)
            | EnqueueError::AllocFailed(v)
            | EnqueueError::Cancelled(v) => v,
        }
    }

    /// The failure without the item.
    pub fn kind(&self) -> QueueError {
        match self {
            EnqueueError::Invalid(_) => QueueError::Invalid,
            EnqueueError::Timeout(_) => QueueError::Timeout,
            EnqueueError::Shutdown(_) => QueueError::Shutdown,
            EnqueueError::AllocFailed(_) => QueueError::AllocFailed,
            EnqueueError::Cancelled(_) => QueueError::Cancelled,
        }
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(..)", self.kind())
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind(), f)
    }
}

impl<T> std::error::Error for EnqueueError<T> {}

/// Errors returned when creating a queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreateError {
    /// `Limit::Max(0)` would block every enqueue.
    #[error("queue limit must be at least 1")]
    ZeroLimit,
    /// The initial buffer could not be allocated.
    #[error("failed to allocate a queue buffer of {capacity} slots")]
    AllocFailed {
        /// Requested slot count.
        capacity: usize,
    },
    /// The registry refused the queue.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl<T> From<EnqueueError<T>> for QueueError {
    fn from(err: EnqueueError<T>) -> Self {
        err.kind()
    }
}

/// Which end of the queue an item is inserted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum End {
    /// Append at the tail: first in, first out.
    #[default]
    Back,
    /// Insert at the head: last in, first out.
    Front,
}

/// Observable state of a queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting enqueues.
    Active,
    /// Shutdown requested; only dequeues are served.
    Draining,
    /// The handle no longer names a queue.
    Invalid,
}

// ============================================================================
// Queue
// ============================================================================

type Destroyer<T> = Box<dyn Fn(T) + Send + Sync>;

struct State<T> {
    ring: Ring<T>,
    limit: Limit,
    draining: bool,
    waiters: usize,
    released: bool,
}

impl<T> State<T> {
    fn at_limit(&self) -> bool {
        matches!(self.limit, Limit::Max(max) if self.ring.len() >= max)
    }

    fn is_drained(&self) -> bool {
        self.ring.is_empty() && self.waiters == 0
    }

    /// Ensure one free slot, doubling the buffer if it is full.
    fn make_room(&mut self) -> Result<(), QueueError> {
        if !self.ring.is_full() {
            return Ok(());
        }
        let grown = grown_capacity(self.ring.capacity(), self.limit).ok_or(QueueError::AllocFailed)?;
        self.ring.resize(grown).map_err(|_| QueueError::AllocFailed)
    }

    /// Halve the buffer once it is less than a quarter full.
    fn shrink(&mut self) {
        let capacity = self.ring.capacity();
        let floor = self.limit.floor();
        if capacity > floor && self.ring.len() < capacity / 4 {
            // Keeping the larger buffer is harmless if the smaller one
            // cannot be allocated.
            let _ = self.ring.resize((capacity / 2).max(floor));
        }
    }
}

/// Size of a full buffer of `capacity` slots after doubling, clamped to a
/// `Max` limit. `None` when doubling overflows.
fn grown_capacity(capacity: usize, limit: Limit) -> Option<usize> {
    let grown = capacity.checked_mul(2)?;
    match limit {
        Limit::Max(max) => Some(grown.min(max.max(capacity + 1))),
        _ => Some(grown),
    }
}

/// A synchronized queue object. Reach it through a [`QueueHandle`].
pub struct Queue<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    drained: Condvar,
    destroyer: Option<Destroyer<T>>,
}

impl<T: Send + 'static> Class for Queue<T> {
    const TAG: TypeTag = TypeTag::new("queue");
}

/// Registers the calling thread as blocked in the queue for its lifetime.
///
/// Dropping it, on any exit path, unregisters the thread and signals a
/// pending shutdown if it was the last one out.
struct Waiter<'a, T> {
    queue: &'a Queue<T>,
    guard: MutexGuard<'a, State<T>>,
}

impl<'a, T> Waiter<'a, T> {
    fn enter(queue: &'a Queue<T>, mut guard: MutexGuard<'a, State<T>>) -> Self {
        guard.waiters += 1;
        Self { queue, guard }
    }

    /// Block on `cond`; returns whether the deadline passed.
    fn wait(&mut self, deadline: &Deadline) -> bool {
        match deadline.instant() {
            None => {
                self.queue.cond.wait(&mut self.guard);
                false
            }
            Some(at) => self.queue.cond.wait_until(&mut self.guard, at).timed_out(),
        }
    }
}

impl<T> Deref for Waiter<'_, T> {
    type Target = State<T>;

    fn deref(&self) -> &State<T> {
        &self.guard
    }
}

impl<T> DerefMut for Waiter<'_, T> {
    fn deref_mut(&mut self) -> &mut State<T> {
        &mut self.guard
    }
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        self.guard.waiters -= 1;
        if self.guard.draining && self.guard.is_drained() {
            self.queue.drained.notify_all();
        }
    }
}

fn cancelled(token: Option<&CancellationToken>) -> bool {
    token.is_some_and(|t| t.is_cancelled())
}

impl<T: Send + 'static> Queue<T> {
    /// Start building a queue.
    pub fn builder() -> QueueBuilder<T> {
        QueueBuilder {
            limit: Limit::Unbounded,
            destroyer: None,
        }
    }

    fn new(limit: Limit, destroyer: Option<Destroyer<T>>) -> Result<Self, CreateError> {
        if limit == Limit::Max(0) {
            return Err(CreateError::ZeroLimit);
        }
        let capacity = limit.floor();
        let ring = Ring::new(capacity).map_err(|_| CreateError::AllocFailed { capacity })?;
        Ok(Self {
            state: Mutex::new(State {
                ring,
                limit,
                draining: false,
                waiters: 0,
                released: false,
            }),
            cond: Condvar::new(),
            drained: Condvar::new(),
            destroyer,
        })
    }

    fn enqueue(
        &self,
        item: T,
        end: End,
        deadline: Deadline,
        token: Option<&CancellationToken>,
    ) -> Result<(), EnqueueError<T>> {
        let mut state = self.state.lock();
        if state.draining {
            return Err(EnqueueError::Shutdown(item));
        }
        if !state.at_limit() {
            return self.push(&mut state, item, end);
        }

        let mut waiter = Waiter::enter(self, state);
        let mut timed_out = false;
        loop {
            if waiter.draining {
                return Err(EnqueueError::Shutdown(item));
            }
            if !waiter.at_limit() {
                return self.push(&mut waiter, item, end);
            }
            if cancelled(token) {
                return Err(EnqueueError::Cancelled(item));
            }
            if timed_out {
                return Err(EnqueueError::Timeout(item));
            }
            timed_out = waiter.wait(&deadline);
        }
    }

    fn push(&self, state: &mut State<T>, item: T, end: End) -> Result<(), EnqueueError<T>> {
        if state.make_room().is_err() {
            tracing::warn!(
                capacity = state.ring.capacity(),
                "queue buffer allocation failed"
            );
            return Err(EnqueueError::AllocFailed(item));
        }
        let was_empty = state.ring.is_empty();
        match end {
            End::Back => state.ring.push_back(item),
            End::Front => state.ring.push_front(item),
        }
        if was_empty {
            self.cond.notify_all();
        }
        Ok(())
    }

    fn dequeue(&self, deadline: Deadline, token: Option<&CancellationToken>) -> Result<T, QueueError> {
        let mut state = self.state.lock();
        if let Some(item) = self.pop(&mut state) {
            return Ok(item);
        }

        let mut waiter = Waiter::enter(self, state);
        let mut timed_out = false;
        loop {
            if let Some(item) = self.pop(&mut waiter) {
                return Ok(item);
            }
            if waiter.draining {
                return Err(QueueError::Shutdown);
            }
            if cancelled(token) {
                return Err(QueueError::Cancelled);
            }
            if timed_out {
                return Err(QueueError::Timeout);
            }
            timed_out = waiter.wait(&deadline);
        }
    }

    fn pop(&self, state: &mut State<T>) -> Option<T> {
        let was_at_limit = state.at_limit();
        let item = state.ring.pop_front()?;
        state.shrink();
        if was_at_limit {
            self.cond.notify_all();
        }
        if state.draining && state.is_drained() {
            self.drained.notify_all();
        }
        Some(item)
    }

    /// Mark the queue draining and wait until it is drained.
    ///
    /// Returns `true` for exactly one caller: the one that must release the
    /// creation reference.
    fn drain(&self, deadline: Deadline, token: Option<&CancellationToken>) -> Result<bool, QueueError> {
        let mut state = self.state.lock();
        if !state.draining {
            state.draining = true;
            self.cond.notify_all();
            tracing::debug!(
                items = state.ring.len(),
                waiters = state.waiters,
                "queue draining"
            );
        }

        let mut timed_out = false;
        while !state.is_drained() {
            if cancelled(token) {
                return Err(QueueError::Cancelled);
            }
            if timed_out {
                return Err(QueueError::Timeout);
            }
            timed_out = match deadline.instant() {
                None => {
                    self.drained.wait(&mut state);
                    false
                }
                Some(at) => self.drained.wait_until(&mut state, at).timed_out(),
            };
        }

        if state.released {
            return Ok(false);
        }
        state.released = true;
        Ok(true)
    }

    /// Wake every blocked thread so it re-checks its predicate.
    fn wake_all(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
        self.drained.notify_all();
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let leftover = state.ring.len();
        if leftover == 0 {
            return;
        }
        tracing::warn!(leftover, "queue destroyed with items still queued");
        if let Some(destroy) = &self.destroyer {
            while let Some(item) = state.ring.pop_front() {
                destroy(item);
            }
        }
    }
}

/// Builder for a registry-managed queue.
pub struct QueueBuilder<T> {
    limit: Limit,
    destroyer: Option<Destroyer<T>>,
}

impl<T: Send + 'static> QueueBuilder<T> {
    /// Set the capacity policy.
    pub fn limit(mut self, limit: impl Into<Limit>) -> Self {
        self.limit = limit.into();
        self
    }

    /// Run `destroy` on each item still queued when the queue is destroyed.
    pub fn destroyer<F>(mut self, destroy: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.destroyer = Some(Box::new(destroy));
        self
    }

    /// Allocate the buffer and register the queue in `registry`.
    ///
    /// Fails for `Limit::Max(0)` and for a floor that cannot be allocated.
    pub fn create(self, registry: &Registry) -> Result<QueueHandle<T>, CreateError> {
        let limit = self.limit;
        let queue = match Queue::new(limit, self.destroyer) {
            Ok(queue) => queue,
            Err(err) => {
                tracing::warn!(?limit, error = %err, "queue creation failed");
                return Err(err);
            }
        };
        let queue = registry.create(queue)?;
        Ok(QueueHandle {
            registry: registry.clone(),
            handle: Ref::into_handle(queue),
            _item: PhantomData,
        })
    }
}

// ============================================================================
// Queue Handle
// ============================================================================

/// A cloneable, sendable name for a queue in a registry.
///
/// Every operation looks the queue up, so a handle outliving its queue is
/// harmless: operations report [`QueueError::Invalid`].
pub struct QueueHandle<T> {
    registry: Registry,
    handle: Handle,
    _item: PhantomData<fn(T) -> T>,
}

impl<T: Send + 'static> QueueHandle<T> {
    /// Create an empty queue with the given limit.
    pub fn create(registry: &Registry, limit: impl Into<Limit>) -> Result<Self, CreateError> {
        Queue::builder().limit(limit).create(registry)
    }

    /// Name an existing queue by its raw handle.
    pub fn from_handle(registry: &Registry, handle: Handle) -> Self {
        Self {
            registry: registry.clone(),
            handle,
            _item: PhantomData,
        }
    }

    /// The queue's handle.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The registry the queue lives in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn acquire(&self) -> Result<Ref<Queue<T>>, QueueError> {
        self.registry
            .lookup_as::<Queue<T>>(self.handle)
            .ok_or(QueueError::Invalid)
    }

    fn wake_on_cancel(queue: &Ref<Queue<T>>, token: &CancellationToken) -> CancelRegistration {
        let queue = Ref::downgrade(queue);
        token.on_cancel(move || {
            if let Some(queue) = queue.upgrade() {
                queue.wake_all();
            }
        })
    }

    /// Insert `item`, blocking up to `timeout` while the queue is at its limit.
    pub fn enqueue(&self, item: T, timeout: impl Into<Timeout>, end: End) -> Result<(), EnqueueError<T>> {
        let deadline = timeout.into().deadline();
        match self.acquire() {
            Ok(queue) => queue.enqueue(item, end, deadline, None),
            Err(_) => Err(EnqueueError::Invalid(item)),
        }
    }

    /// [`QueueHandle::enqueue`] that also gives up when `token` is cancelled.
    pub fn enqueue_cancellable(
        &self,
        item: T,
        timeout: impl Into<Timeout>,
        end: End,
        token: &CancellationToken,
    ) -> Result<(), EnqueueError<T>> {
        let deadline = timeout.into().deadline();
        let queue = match self.acquire() {
            Ok(queue) => queue,
            Err(_) => return Err(EnqueueError::Invalid(item)),
        };
        let _registration = Self::wake_on_cancel(&queue, token);
        queue.enqueue(item, end, deadline, Some(token))
    }

    /// Append `item`, waiting as long as it takes.
    pub fn push(&self, item: T) -> Result<(), EnqueueError<T>> {
        self.enqueue(item, Timeout::Forever, End::Back)
    }

    /// Remove the head item, blocking up to `timeout` while the queue is empty.
    pub fn dequeue(&self, timeout: impl Into<Timeout>) -> Result<T, QueueError> {
        let deadline = timeout.into().deadline();
        self.acquire()?.dequeue(deadline, None)
    }

    /// [`QueueHandle::dequeue`] that also gives up when `token` is cancelled.
    pub fn dequeue_cancellable(
        &self,
        timeout: impl Into<Timeout>,
        token: &CancellationToken,
    ) -> Result<T, QueueError> {
        let deadline = timeout.into().deadline();
        let queue = self.acquire()?;
        let _registration = Self::wake_on_cancel(&queue, token);
        queue.dequeue(deadline, Some(token))
    }

    /// Remove the head item without blocking.
    pub fn try_dequeue(&self) -> Result<T, QueueError> {
        self.dequeue(Timeout::Immediate)
    }

    /// Stop accepting items and wait up to `timeout` for the queue to drain.
    ///
    /// On success the creation reference is released; once every other
    /// reference is gone the handle becomes invalid. On `Timeout` the queue
    /// stays draining and shutdown may be called again.
    pub fn shutdown(&self, timeout: impl Into<Timeout>) -> Result<(), QueueError> {
        self.shutdown_until(timeout.into().deadline(), None)
    }

    /// [`QueueHandle::shutdown`] that also gives up when `token` is cancelled.
    pub fn shutdown_cancellable(
        &self,
        timeout: impl Into<Timeout>,
        token: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.shutdown_until(timeout.into().deadline(), Some(token))
    }

    fn shutdown_until(&self, deadline: Deadline, token: Option<&CancellationToken>) -> Result<(), QueueError> {
        let queue = self.acquire()?;
        let _registration = token.map(|t| Self::wake_on_cancel(&queue, t));
        if queue.drain(deadline, token)? {
            tracing::debug!(handle = %self.handle, "queue drained, releasing");
            self.registry
                .release(self.handle)
                .map_err(|_| QueueError::Invalid)?;
        }
        Ok(())
    }

    /// Run `f` on the head item without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> Result<R, QueueError> {
        let queue = self.acquire()?;
        let state = queue.state.lock();
        Ok(f(state.ring.front()))
    }

    /// A copy of the head item, if any.
    pub fn peek(&self) -> Result<Option<T>, QueueError>
    where
        T: Clone,
    {
        self.peek_with(|head| head.cloned())
    }

    /// Number of queued items.
    pub fn count(&self) -> Result<usize, QueueError> {
        Ok(self.acquire()?.state.lock().ring.len())
    }

    /// Current buffer size in slots.
    pub fn capacity(&self) -> Result<usize, QueueError> {
        Ok(self.acquire()?.state.lock().ring.capacity())
    }

    /// Whether the queue is active, draining or gone.
    pub fn state(&self) -> QueueState {
        match self.acquire() {
            Ok(queue) if queue.state.lock().draining => QueueState::Draining,
            Ok(_) => QueueState::Active,
            Err(_) => QueueState::Invalid,
        }
    }
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            handle: self.handle,
            _item: PhantomData,
        }
    }
}

impl<T> fmt::Debug for QueueHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("handle", &self.handle)
            .finish()
    }
}
