//! # Thread Pool
//!
//! A fixed set of OS worker threads fed from a registry-managed
//! [`QueueHandle`].
//!
//! ## Design
//!
//! - Workers are named `hobj-worker-{i}` and block in `dequeue(Forever)`.
//! - Each task runs under `catch_unwind`; a panicking task is counted and
//!   logged, and the worker moves on to the next one.
//! - Shutting the pool down shuts the task queue down. Workers keep dequeuing
//!   while it drains, so every accepted task runs before the workers exit.
//! - A [`Spawner`] submits to the same queue from any thread and does not
//!   keep the pool alive.
//!
//! # Example
//!
//! ```rust,ignore
//! use hobj_runtime::pool::ThreadPool;
//! use hobj_runtime::{PoolConfig, Registry, Timeout};
//!
//! let registry = Registry::new();
//! let mut pool = ThreadPool::new(&registry, PoolConfig::default())?;
//!
//! pool.submit(|| println!("hello from a worker"))?;
//! pool.shutdown(Timeout::Forever)?;
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::{ConfigError, PoolConfig};
use crate::queue::{CreateError, End, QueueError, QueueHandle};
use crate::registry::Registry;
use crate::timeout::Timeout;

/// A unit of work run on a pool thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned by the thread pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The task queue could not be created.
    #[error("failed to create task queue: {0}")]
    Queue(#[from] CreateError),
    /// A task could not be enqueued.
    #[error("task submission failed: {0}")]
    Submit(QueueError),
    /// The task queue did not drain.
    #[error("pool shutdown failed: {0}")]
    Shutdown(QueueError),
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks accepted by `submit`.
    pub submitted: u64,
    /// Tasks that returned normally.
    pub completed: u64,
    /// Tasks that panicked.
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Spawner
// ============================================================================

/// Submits tasks to a pool from anywhere.
#[derive(Clone)]
pub struct Spawner {
    queue: QueueHandle<Task>,
    counters: Arc<Counters>,
    timeout: Timeout,
}

impl Spawner {
    /// Submit `f`, waiting up to the pool's configured submit timeout.
    pub fn submit<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_timeout(f, self.timeout)
    }

    /// Submit `f`, waiting up to `timeout` for room in the task queue.
    pub fn submit_timeout<F>(&self, f: F, timeout: impl Into<Timeout>) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue
            .enqueue(Box::new(f), timeout, End::Back)
            .map_err(|err| PoolError::Submit(err.kind()))?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for Spawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawner")
            .field("queue", &self.queue)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// Thread Pool
// ============================================================================

/// Fixed-size pool of worker threads.
pub struct ThreadPool {
    spawner: Spawner,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Validate `config`, create the task queue in `registry` and start the
    /// workers.
    pub fn new(registry: &Registry, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let queue = QueueHandle::<Task>::create(registry, config.queue_limit)?;
        let counters = Arc::new(Counters::default());

        let workers = (0..config.num_workers)
            .map(|id| {
                let queue = queue.clone();
                let counters = Arc::clone(&counters);
                thread::Builder::new()
                    .name(format!("hobj-worker-{}", id))
                    .spawn(move || run_worker(id, queue, counters))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::debug!(
            workers = config.num_workers,
            queue = %queue.handle(),
            "thread pool started"
        );

        Ok(Self {
            spawner: Spawner {
                queue,
                counters,
                timeout: config.submit_timeout,
            },
            workers,
        })
    }

    /// Number of worker threads still attached to the pool.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Submit `f` with the configured submit timeout.
    pub fn submit<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawner.submit(f)
    }

    /// Submit `f`, waiting up to `timeout` for room in the task queue.
    pub fn submit_timeout<F>(&self, f: F, timeout: impl Into<Timeout>) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawner.submit_timeout(f, timeout)
    }

    /// A cloneable submitter for this pool.
    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    /// Tasks waiting in the queue, or 0 once the pool is shut down.
    pub fn queued(&self) -> usize {
        self.spawner.queue.count().unwrap_or(0)
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.spawner.stats()
    }

    /// Whether the workers have been joined.
    pub fn is_shut_down(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop accepting tasks, run what is queued and join the workers.
    ///
    /// `timeout` bounds the wait for the queue to drain. On timeout the pool
    /// keeps draining and shutdown may be retried.
    pub fn shutdown(&mut self, timeout: impl Into<Timeout>) -> Result<(), PoolError> {
        if self.workers.is_empty() {
            return Ok(());
        }
        match self.spawner.queue.shutdown(timeout) {
            Ok(()) | Err(QueueError::Invalid) => {}
            Err(err) => return Err(PoolError::Shutdown(err)),
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("pool worker exited by panic");
            }
        }
        tracing::debug!(stats = ?self.stats(), "thread pool stopped");
        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown(Timeout::Forever) {
            tracing::warn!(error = %err, "thread pool shutdown failed on drop");
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.len())
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_worker(id: usize, queue: QueueHandle<Task>, counters: Arc<Counters>) {
    // Forever never times out; any error means the queue is gone or draining.
    while let Ok(task) = queue.dequeue(Timeout::Forever) {
        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    worker = id,
                    message = panic_message(payload.as_ref()),
                    "task panicked"
                );
            }
        }
    }
    tracing::trace!(worker = id, "pool worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn pool(workers: usize) -> (Registry, ThreadPool) {
        let registry = Registry::new();
        let config = PoolConfig {
            num_workers: workers,
            ..PoolConfig::default()
        };
        let pool = ThreadPool::new(&registry, config).unwrap();
        (registry, pool)
    }

    #[test]
    fn test_runs_submitted_tasks() {
        let (_registry, mut pool) = pool(4);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let hits = Arc::clone(&hits);
            pool.submit(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown(Timeout::Forever).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
        assert_eq!(
            pool.stats(),
            PoolStats {
                submitted: 100,
                completed: 100,
                panicked: 0
            }
        );
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let (_registry, mut pool) = pool(1);
        pool.submit(|| panic!("boom")).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.submit(move || tx.send(()).unwrap()).unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown(Timeout::Forever).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_shutdown_runs_pending_tasks() {
        let (_registry, mut pool) = pool(1);
        let hits = Arc::new(AtomicUsize::new(0));
        pool.submit(|| thread::sleep(Duration::from_millis(20))).unwrap();
        for _ in 0..10 {
            let hits = Arc::clone(&hits);
            pool.submit(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown(Timeout::Forever).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert!(pool.is_shut_down());
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let (registry, mut pool) = pool(2);
        let spawner = pool.spawner();
        pool.shutdown(Timeout::Forever).unwrap();

        assert_eq!(
            spawner.submit(|| {}),
            Err(PoolError::Submit(QueueError::Invalid))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_spawner_from_other_thread() {
        let (_registry, pool) = pool(2);
        let spawner = pool.spawner();
        let (tx, rx) = crossbeam_channel::unbounded();

        thread::spawn(move || {
            for i in 0..5 {
                let tx = tx.clone();
                spawner.submit(move || tx.send(i).unwrap()).unwrap();
            }
        })
        .join()
        .unwrap();

        let mut got: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let registry = Registry::new();
        let config = PoolConfig {
            num_workers: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(
            ThreadPool::new(&registry, config),
            Err(PoolError::Config(_))
        ));
    }

    #[test]
    fn test_drop_joins_workers() {
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let (_registry, pool) = pool(2);
            for _ in 0..10 {
                let hits = Arc::clone(&hits);
                pool.submit(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}
