//! # FFI Exports
//!
//! C-compatible queue API over a process-wide default registry.
//!
//! ## Design
//!
//! C callers cannot thread a [`Registry`] through their code, so every export
//! works on one lazily created registry with the default configuration.
//! Queues are named by their raw 64-bit handle (`0` is never issued) and carry
//! opaque `void *` items that are never dereferenced here. Items still queued
//! when a queue is destroyed are leaked to the caller, exactly as if they had
//! never been enqueued.
//!
//! Timeouts are seconds as `double`: negative blocks forever, zero fails fast
//! and positive waits that long.
//!
//! ## Usage
//!
//! Build as a cdylib or staticlib:
//! ```toml
//! [lib]
//! crate-type = ["cdylib", "staticlib", "rlib"]
//! ```
//!
//! Then link with `-lhobj_runtime`.

use std::ffi::{c_int, c_void};
use std::sync::OnceLock;

use crate::object::Handle;
use crate::queue::{End, QueueError, QueueHandle, QueueState};
use crate::registry::Registry;
use crate::timeout::Timeout;

/// Success.
pub const HOBJ_OK: c_int = 0;
/// Unknown, stale or non-queue handle.
pub const HOBJ_INVALID: c_int = 1;
/// The timeout elapsed.
pub const HOBJ_TIMEOUT: c_int = 2;
/// The queue is shutting down.
pub const HOBJ_SHUTDOWN: c_int = 3;
/// Out of memory.
pub const HOBJ_NOMEM: c_int = 4;
/// Nothing to peek at.
pub const HOBJ_EMPTY: c_int = 5;

static DEFAULT_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The registry behind every export in this module.
pub fn default_registry() -> &'static Registry {
    DEFAULT_REGISTRY.get_or_init(Registry::new)
}

/// An opaque C item. The queue only moves it around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RawItem(pub *mut c_void);

// SAFETY: the pointer is never dereferenced on the Rust side; ownership of
// the pointee is the C caller's concern.
unsafe impl Send for RawItem {}

fn queue(raw: u64) -> Option<QueueHandle<RawItem>> {
    Handle::from_raw(raw).map(|handle| QueueHandle::from_handle(default_registry(), handle))
}

fn status(err: QueueError) -> c_int {
    match err {
        QueueError::Invalid => HOBJ_INVALID,
        QueueError::Timeout => HOBJ_TIMEOUT,
        QueueError::Shutdown => HOBJ_SHUTDOWN,
        QueueError::AllocFailed => HOBJ_NOMEM,
        // No export takes a cancellation token.
        QueueError::Cancelled => HOBJ_TIMEOUT,
    }
}

fn code(result: Result<(), QueueError>) -> c_int {
    result.map_or_else(status, |()| HOBJ_OK)
}

// ============================================================================
// Queue Functions
// ============================================================================

/// Create a queue. Returns its handle, or 0 on failure.
///
/// `limit` is 0 for unbounded, negative for a minimum buffer size and
/// positive for a maximum item count.
#[no_mangle]
pub extern "C" fn hobj_queue_create(limit: i64) -> u64 {
    match QueueHandle::<RawItem>::create(default_registry(), limit) {
        Ok(queue) => queue.handle().into_raw(),
        Err(err) => {
            tracing::warn!(error = %err, "hobj_queue_create failed");
            0
        }
    }
}

/// Enqueue `item` at the tail, or at the head when `lifo` is non-zero.
#[no_mangle]
pub extern "C" fn hobj_queue_enqueue(
    queue_handle: u64,
    item: *mut c_void,
    timeout_secs: f64,
    lifo: c_int,
) -> c_int {
    let Some(queue) = queue(queue_handle) else {
        return HOBJ_INVALID;
    };
    let end = if lifo != 0 { End::Front } else { End::Back };
    code(
        queue
            .enqueue(RawItem(item), Timeout::from_secs_f64(timeout_secs), end)
            .map_err(|err| err.kind()),
    )
}

/// Dequeue the head item into `*out`.
///
/// # Safety
///
/// `out` must be null or valid for a pointer-sized write. It is written only
/// on `HOBJ_OK`.
#[no_mangle]
pub unsafe extern "C" fn hobj_queue_dequeue(
    queue_handle: u64,
    timeout_secs: f64,
    out: *mut *mut c_void,
) -> c_int {
    let Some(queue) = queue(queue_handle) else {
        return HOBJ_INVALID;
    };
    match queue.dequeue(Timeout::from_secs_f64(timeout_secs)) {
        Ok(RawItem(item)) => {
            if !out.is_null() {
                *out = item;
            }
            HOBJ_OK
        }
        Err(err) => status(err),
    }
}

/// Copy the head item into `*out` without removing it.
///
/// # Safety
///
/// `out` must be null or valid for a pointer-sized write. It is written only
/// on `HOBJ_OK`.
#[no_mangle]
pub unsafe extern "C" fn hobj_queue_peek(queue_handle: u64, out: *mut *mut c_void) -> c_int {
    let Some(queue) = queue(queue_handle) else {
        return HOBJ_INVALID;
    };
    match queue.peek() {
        Ok(Some(RawItem(item))) => {
            if !out.is_null() {
                *out = item;
            }
            HOBJ_OK
        }
        Ok(None) => HOBJ_EMPTY,
        Err(err) => status(err),
    }
}

/// Stop accepting items and wait for the queue to drain, then release it.
#[no_mangle]
pub extern "C" fn hobj_queue_shutdown(queue_handle: u64, timeout_secs: f64) -> c_int {
    let Some(queue) = queue(queue_handle) else {
        return HOBJ_INVALID;
    };
    code(queue.shutdown(Timeout::from_secs_f64(timeout_secs)))
}

/// Number of queued items, or -1 for an invalid handle.
#[no_mangle]
pub extern "C" fn hobj_queue_count(queue_handle: u64) -> i64 {
    queue(queue_handle)
        .and_then(|queue| queue.count().ok())
        .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
}

/// 0 for active, 1 for draining, -1 for an invalid handle.
#[no_mangle]
pub extern "C" fn hobj_queue_state(queue_handle: u64) -> c_int {
    match queue(queue_handle).map(|queue| queue.state()) {
        Some(QueueState::Active) => 0,
        Some(QueueState::Draining) => 1,
        Some(QueueState::Invalid) | None => -1,
    }
}

// ============================================================================
// Registry Functions
// ============================================================================

/// Number of live objects in the default registry.
#[no_mangle]
pub extern "C" fn hobj_registry_live() -> u64 {
    default_registry().len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn item(n: usize) -> *mut c_void {
        n as *mut c_void
    }

    #[test]
    fn test_round_trip_through_c_api() {
        let q = hobj_queue_create(0);
        assert_ne!(q, 0);
        assert_eq!(hobj_queue_state(q), 0);

        assert_eq!(hobj_queue_enqueue(q, item(1), -1.0, 0), HOBJ_OK);
        assert_eq!(hobj_queue_enqueue(q, item(2), -1.0, 0), HOBJ_OK);
        assert_eq!(hobj_queue_enqueue(q, item(0), -1.0, 1), HOBJ_OK);
        assert_eq!(hobj_queue_count(q), 3);

        let mut out = ptr::null_mut();
        unsafe {
            assert_eq!(hobj_queue_peek(q, &mut out), HOBJ_OK);
            assert_eq!(out, item(0));
            for expected in 0..3 {
                assert_eq!(hobj_queue_dequeue(q, 0.0, &mut out), HOBJ_OK);
                assert_eq!(out, item(expected));
            }
            assert_eq!(hobj_queue_dequeue(q, 0.0, &mut out), HOBJ_TIMEOUT);
            assert_eq!(hobj_queue_peek(q, &mut out), HOBJ_EMPTY);
        }

        assert_eq!(hobj_queue_shutdown(q, 0.0), HOBJ_OK);
        assert_eq!(hobj_queue_state(q), -1);
        assert_eq!(hobj_queue_count(q), -1);
        assert_eq!(hobj_queue_enqueue(q, item(9), 0.0, 0), HOBJ_INVALID);
    }

    #[test]
    fn test_null_handle_is_invalid() {
        assert_eq!(hobj_queue_state(0), -1);
        assert_eq!(hobj_queue_count(0), -1);
        assert_eq!(hobj_queue_shutdown(0, 0.0), HOBJ_INVALID);
        unsafe {
            assert_eq!(hobj_queue_dequeue(0, 0.0, ptr::null_mut()), HOBJ_INVALID);
        }
    }

    #[test]
    fn test_bounded_enqueue_times_out() {
        let q = hobj_queue_create(1);
        assert_eq!(hobj_queue_enqueue(q, item(1), 0.0, 0), HOBJ_OK);
        assert_eq!(hobj_queue_enqueue(q, item(2), 0.0, 0), HOBJ_TIMEOUT);
        assert_eq!(hobj_queue_shutdown(q, 0.0), HOBJ_TIMEOUT);
        assert_eq!(hobj_queue_state(q), 1);
        assert_eq!(hobj_queue_enqueue(q, item(3), 0.0, 0), HOBJ_SHUTDOWN);

        unsafe {
            assert_eq!(hobj_queue_dequeue(q, 0.0, ptr::null_mut()), HOBJ_OK);
        }
        assert_eq!(hobj_queue_shutdown(q, 0.0), HOBJ_OK);
    }
}
