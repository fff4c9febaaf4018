//! Runtime Configuration
//!
//! Configuration is set programmatically; nothing here reads the environment.
//! The only environment hook in the crate is `RUST_LOG`, honoured by
//! [`crate::log::init`].
//!
//! | Section | Field | Default |
//! |---------|-------|---------|
//! | registry | `backend` | `Locked` |
//! | registry | `initial_slots` | 64 |
//! | registry | `max_slots` | 2^24 |
//! | registry | `probe_limit` | 16 |
//! | registry | `growable` | true |
//! | pool | `num_workers` | CPU count |
//! | pool | `queue_limit` | unbounded |
//! | pool | `submit_timeout` | forever |
//! | log | `level` | info |
//! | log | `format` | plain |
//!
//! # Example
//!
//! ```rust,ignore
//! use hobj_runtime::config::{Backend, RuntimeConfig};
//!
//! let config = RuntimeConfig::builder()
//!     .backend(Backend::LockFree)
//!     .num_workers(4)
//!     .build()?;
//! ```

use crate::queue::Limit;
use crate::timeout::Timeout;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Output format for the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parse a log format from a string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Plain => "plain",
            LogFormat::Json => "json",
        }
    }
}

/// Registry table implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// One mutex guards the whole table.
    #[default]
    Locked,
    /// Per-slot atomic state words; a lock is taken only to grow the table.
    LockFree,
}

/// Handle registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Table implementation.
    /// Default: `Locked`.
    pub backend: Backend,

    /// Slots allocated up front. Must be a power of two, at least 2.
    /// Default: 64.
    pub initial_slots: usize,

    /// Ceiling the table may grow to. Must be a power of two.
    /// Default: 2^24.
    pub max_slots: usize,

    /// Candidate handle values tried before the table doubles.
    /// Default: 16.
    pub probe_limit: usize,

    /// Whether the table may grow past `initial_slots`.
    /// Default: true.
    pub growable: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Locked,
            initial_slots: 64,
            max_slots: 1 << 24,
            probe_limit: 16,
            growable: true,
        }
    }
}

impl RegistryConfig {
    /// Validate the registry section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_slots < 2 || !self.initial_slots.is_power_of_two() {
            return Err(ConfigError::invalid(
                "registry.initial_slots",
                "must be a power of two, at least 2",
            ));
        }
        if !self.max_slots.is_power_of_two() {
            return Err(ConfigError::invalid(
                "registry.max_slots",
                "must be a power of two",
            ));
        }
        if self.max_slots < self.initial_slots {
            return Err(ConfigError::invalid(
                "registry.max_slots",
                "must be at least initial_slots",
            ));
        }
        if self.probe_limit == 0 {
            return Err(ConfigError::invalid(
                "registry.probe_limit",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// The largest table this configuration allows.
    pub fn ceiling(&self) -> usize {
        if self.growable {
            self.max_slots
        } else {
            self.initial_slots
        }
    }
}

/// Thread pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Limit on the task queue.
    /// Default: unbounded.
    pub queue_limit: Limit,

    /// How long `submit` blocks on a full task queue.
    /// Default: forever.
    pub submit_timeout: Timeout,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            queue_limit: Limit::Unbounded,
            submit_timeout: Timeout::Forever,
        }
    }
}

impl PoolConfig {
    /// Validate the pool section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::invalid("pool.num_workers", "must be at least 1"));
        }
        if self.queue_limit == Limit::Max(0) || self.queue_limit == Limit::Minimum(0) {
            return Err(ConfigError::invalid(
                "pool.queue_limit",
                "a bounded limit must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Fallback level when `RUST_LOG` is unset.
    /// Default: Info.
    pub level: LogLevel,

    /// Output format.
    /// Default: Plain.
    pub format: LogFormat,

    /// Include thread names in log output.
    /// Default: true.
    pub thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Plain,
            thread_names: true,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults or
/// [`RuntimeConfig::builder`] to override individual fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Registry configuration.
    pub registry: RegistryConfig,
    /// Thread pool configuration.
    pub pool: PoolConfig,
    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Validate the configuration and return the first error found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.validate()?;
        self.pool.validate()?;
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &str, message: &str) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.registry.backend = backend;
        self
    }

    /// Set the initial registry table size.
    pub fn initial_slots(mut self, n: usize) -> Self {
        self.config.registry.initial_slots = n;
        self
    }

    /// Set the registry table ceiling.
    pub fn max_slots(mut self, n: usize) -> Self {
        self.config.registry.max_slots = n;
        self
    }

    /// Set how many candidate handles are probed before growing.
    pub fn probe_limit(mut self, n: usize) -> Self {
        self.config.registry.probe_limit = n;
        self
    }

    /// Allow or forbid registry growth.
    pub fn growable(mut self, growable: bool) -> Self {
        self.config.registry.growable = growable;
        self
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.pool.num_workers = n;
        self
    }

    /// Set the task queue limit.
    pub fn queue_limit(mut self, limit: Limit) -> Self {
        self.config.pool.queue_limit = limit;
        self
    }

    /// Set the default submit timeout.
    pub fn submit_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.config.pool.submit_timeout = timeout.into();
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
