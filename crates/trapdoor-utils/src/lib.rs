//! # trapdoor Utilities
//!
//! Logging setup shared by the trapdoor crates.
//!
//! The core only emits `tracing` events; front ends call one of the
//! initializers here once at startup to decide where they go.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
