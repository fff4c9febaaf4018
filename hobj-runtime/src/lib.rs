//! # hobj Runtime Library
//!
//! Handle-managed objects for multithreaded programs:
//!
//! - **Registry**: opaque handles to reference-counted, type-tagged objects,
//!   with a lock-based and a lock-free table
//! - **Queues**: bounded or unbounded blocking queues that live in a registry,
//!   with timeouts, cancellation and graceful shutdown
//! - **Thread Pool**: fixed workers fed from a registry queue
//! - **Timers**: delayed and periodic callbacks dispatched to the pool
//! - **FFI Support**: a C ABI over a process-wide default registry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HOBJ RUNTIME                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │    Timers    │─▶│  Thread Pool │  │    C ABI     │           │
//! │  │  (timer.rs)  │  │  (pool.rs)   │  │(ffi_exports) │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                           │                 │                   │
//! │                    ┌──────────────┐         │                   │
//! │                    │    Queues    │◀────────┘                   │
//! │                    │  (queue/)    │                             │
//! │                    └──────────────┘                             │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │ Cancellation │  │   Registry   │  │   Timeouts   │           │
//! │  │              │  │ (registry/)  │  │ (timeout.rs) │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use hobj_runtime::{Runtime, RuntimeConfig, Timeout};
//! use std::time::Duration;
//!
//! let mut runtime = Runtime::new(RuntimeConfig::default())?;
//! runtime.pool().submit(|| println!("now"))?;
//! runtime.timer().schedule(Duration::from_millis(10), || println!("later"))?;
//! runtime.shutdown(Timeout::Forever)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cancellation;
pub mod config;
pub mod ffi_exports;
pub mod log;
pub mod object;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod timeout;
pub mod timer;

// Re-exports
pub use cancellation::{CancelRegistration, CancellationError, CancellationSource, CancellationToken};
pub use config::{
    Backend, ConfigError, LogConfig, LogFormat, LogLevel, PoolConfig, RegistryConfig, RuntimeConfig,
    RuntimeConfigBuilder,
};
pub use object::{Class, Handle, Object, TypeTag};
pub use pool::{PoolError, PoolStats, Spawner, ThreadPool};
pub use queue::{CreateError, End, EnqueueError, Limit, QueueBuilder, QueueError, QueueHandle, QueueState};
pub use registry::{ObjRef, Ref, Registry, RegistryError, RegistryStats};
pub use timeout::{Deadline, Timeout};
pub use timer::{TimerError, TimerId, TimerScheduler};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A registry, a thread pool and a timer scheduler wired together.
///
/// Logging is not installed here; call [`log::init`] with
/// `RuntimeConfig::log` if this process owns its subscriber.
#[derive(Debug)]
pub struct Runtime {
    // Dropped in order: the timer stops before the pool it feeds.
    timer: TimerScheduler,
    pool: ThreadPool,
    registry: Registry,
}

impl Runtime {
    /// Validate `config` and start the pool and timer threads.
    pub fn new(config: RuntimeConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let registry = Registry::with_config(config.registry)?;
        let pool = ThreadPool::new(&registry, config.pool)?;
        let timer = TimerScheduler::new(pool.spawner());
        tracing::debug!(version = VERSION, "runtime started");
        Ok(Self {
            timer,
            pool,
            registry,
        })
    }

    /// The runtime's registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The runtime's thread pool.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// The runtime's timer scheduler.
    pub fn timer(&self) -> &TimerScheduler {
        &self.timer
    }

    /// Stop the timer, then drain and join the pool.
    pub fn shutdown(&mut self, timeout: impl Into<Timeout>) -> Result<(), PoolError> {
        self.timer.shutdown();
        self.pool.shutdown(timeout)
    }
}
