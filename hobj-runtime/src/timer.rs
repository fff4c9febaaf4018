//! # Timer Scheduler
//!
//! Delayed and periodic callbacks run on a [`ThreadPool`](crate::pool::ThreadPool).
//!
//! ## Design
//!
//! One `hobj-timer` thread owns a min-heap of `(due, TimerId)` and a map from
//! id to callback. Callers talk to it only through a `crossbeam-channel`
//! command channel, so the heap needs no lock. The thread sleeps in
//! `recv_deadline` until the earliest due time or the next command.
//!
//! Cancelling removes the map entry and leaves the heap entry behind; stale
//! heap entries are skipped when they surface.
//!
//! Due callbacks are handed to the pool through a [`Spawner`] without
//! blocking. The timer thread never runs user code itself, and a full pool
//! queue costs one firing rather than stalling every timer.
//!
//! ## Technical References
//!
//! - [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - [Hashed and Hierarchical Timing Wheels](https://doi.org/10.1145/41457.37504)

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{self as cc, RecvTimeoutError};

use crate::pool::{PoolError, Spawner};
use crate::queue::QueueError;
use crate::timeout::Timeout;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Due time used for delays too large to represent.
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

/// Identifies a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl TimerId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timer({})", self.0)
    }
}

/// Errors returned by the timer scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// The timer thread has stopped.
    #[error("timer scheduler has shut down")]
    Stopped,
}

enum Job {
    Once(Box<dyn FnOnce() + Send>),
    Repeating {
        period: Duration,
        callback: Arc<dyn Fn() + Send + Sync>,
    },
}

enum Command {
    Schedule { id: TimerId, due: Instant, job: Job },
    Cancel(TimerId),
    Shutdown,
}

/// Runs callbacks on a pool after a delay.
pub struct TimerScheduler {
    commands: cc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl TimerScheduler {
    /// Start the timer thread. Due callbacks are submitted through `spawner`.
    pub fn new(spawner: Spawner) -> Self {
        let (commands, inbox) = cc::unbounded();
        let thread = thread::Builder::new()
            .name("hobj-timer".to_string())
            .spawn(move || TimerThread::new(spawner).run(inbox))
            .expect("failed to spawn timer thread");

        Self {
            commands,
            thread: Some(thread),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `f` once, `delay` from now.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> Result<TimerId, TimerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_schedule(delay, Job::Once(Box::new(f)))
    }

    /// Run `f` `delay` from now and then every `period` until cancelled.
    ///
    /// Periods shorter than a millisecond are rounded up to one.
    pub fn schedule_repeating<F>(
        &self,
        delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<TimerId, TimerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let job = Job::Repeating {
            period: period.max(MIN_PERIOD),
            callback: Arc::new(f),
        };
        self.send_schedule(delay, job)
    }

    fn send_schedule(&self, delay: Duration, job: Job) -> Result<TimerId, TimerError> {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        let due = now
            .checked_add(delay)
            .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS));
        self.commands
            .send(Command::Schedule { id, due, job })
            .map_err(|_| TimerError::Stopped)?;
        Ok(id)
    }

    /// Remove a pending timer. Unknown or already fired ids are ignored.
    pub fn cancel(&self, id: TimerId) -> Result<(), TimerError> {
        self.commands
            .send(Command::Cancel(id))
            .map_err(|_| TimerError::Stopped)
    }

    /// Stop the timer thread, discarding pending timers.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        // A send failure means the thread is already gone.
        let _ = self.commands.send(Command::Shutdown);
        if thread.join().is_err() {
            tracing::warn!("timer thread exited by panic");
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

// ============================================================================
// Timer Thread
// ============================================================================

struct TimerThread {
    spawner: Spawner,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    jobs: HashMap<TimerId, (Instant, Job)>,
}

impl TimerThread {
    fn new(spawner: Spawner) -> Self {
        Self {
            spawner,
            heap: BinaryHeap::new(),
            jobs: HashMap::new(),
        }
    }

    fn run(mut self, inbox: cc::Receiver<Command>) {
        loop {
            self.fire_due(Instant::now());

            let next_due = self.heap.peek().map(|Reverse((due, _))| *due);
            let received = match next_due {
                Some(due) => inbox.recv_deadline(due),
                None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(Command::Schedule { id, due, job }) => {
                    self.heap.push(Reverse((due, id)));
                    self.jobs.insert(id, (due, job));
                }
                Ok(Command::Cancel(id)) => {
                    if self.jobs.remove(&id).is_some() {
                        tracing::trace!(%id, "timer cancelled");
                    }
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        tracing::debug!(pending = self.jobs.len(), "timer thread stopped");
    }

    fn fire_due(&mut self, now: Instant) {
        while let Some(&Reverse((due, id))) = self.heap.peek() {
            if due > now {
                break;
            }
            self.heap.pop();
            // A stale heap entry for a cancelled or re-armed timer.
            if self.jobs.get(&id).map(|(at, _)| *at) != Some(due) {
                continue;
            }
            let Some((_, job)) = self.jobs.remove(&id) else {
                continue;
            };

            match job {
                Job::Once(f) => {
                    self.submit(id, f);
                }
                Job::Repeating { period, callback } => {
                    let task = Arc::clone(&callback);
                    if self.submit(id, Box::new(move || task())) {
                        // Skip missed periods instead of firing them back to back.
                        let mut next = due + period;
                        if next <= now {
                            next = now + period;
                        }
                        self.heap.push(Reverse((next, id)));
                        self.jobs.insert(id, (next, Job::Repeating { period, callback }));
                    }
                }
            }
        }
    }

    /// Hand `task` to the pool. Returns whether a repeating timer stays armed.
    fn submit(&self, id: TimerId, task: Box<dyn FnOnce() + Send>) -> bool {
        match self.spawner.submit_timeout(task, Timeout::Immediate) {
            Ok(()) => true,
            Err(PoolError::Submit(QueueError::Timeout)) => {
                tracing::warn!(%id, "pool queue full, timer callback dropped");
                true
            }
            Err(err) => {
                tracing::warn!(%id, error = %err, "timer callback dropped");
                false
            }
        }
    }
}
