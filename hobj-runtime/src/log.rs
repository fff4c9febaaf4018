//! Logging Infrastructure
//!
//! The crate emits events through `tracing`; this module installs a
//! `tracing-subscriber` formatter to print them.
//!
//! # Features
//!
//! - **Filtering**: `RUST_LOG` directives when set, the configured
//!   [`LogLevel`] otherwise
//! - **Output Formats**: plain text and JSON
//! - **Thread Names**: optional, useful with pool workers (`hobj-worker-N`)
//!
//! Libraries embedding the crate are free to install their own subscriber
//! instead; nothing here is required for the crate to work.
//!
//! # Example
//!
//! ```rust,ignore
//! use hobj_runtime::config::{LogConfig, LogFormat};
//!
//! hobj_runtime::log::init(&LogConfig {
//!     format: LogFormat::Json,
//!     ..LogConfig::default()
//! })?;
//! ```

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat, LogLevel};

/// Errors from [`init`].
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// A global subscriber is already installed.
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

impl LogLevel {
    /// The matching `tracing` filter.
    pub fn as_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Build the event filter: `RUST_LOG` if it parses, `level` otherwise.
pub fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.as_filter().into()))
}

/// Install the global subscriber described by `config`.
pub fn init(config: &LogConfig) -> Result<(), LogError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level))
        .with_thread_names(config.thread_names);

    let result = match config.format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|_| LogError::AlreadyInitialized)
}
