//! Common utilities for fifo-stream
//!
//! This crate provides the pieces shared by the streaming binary and its
//! tooling: the application error type, logging setup and human-readable
//! throughput formatting.

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{ProgressSnapshot, format_bytes, format_bytes_per_second, format_duration};
