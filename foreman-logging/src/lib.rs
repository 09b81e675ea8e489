//! Logging initialisation for Foreman
//!
//! The parent process logs according to [`foreman_config::LoggingConfig`];
//! worker processes always log to stderr.

pub mod init;

pub use init::{init_logging_from_config, init_simple_tracing, init_worker_tracing};
