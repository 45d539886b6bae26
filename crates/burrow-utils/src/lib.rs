//! # Burrow Utilities
//!
//! Ambient concerns shared by burrow tools: logging setup and environment
//! configuration. The core library depends on neither; it only emits
//! `tracing` events and takes its settings as arguments.

pub mod config;
pub mod logging;

pub use config::{ConfigError, ToolkitConfig};
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
