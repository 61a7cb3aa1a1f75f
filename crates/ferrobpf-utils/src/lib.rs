//! # ferrobpf Utilities
//!
//! Shared utilities for the ferrobpf workspace.
//!
//! Currently this is the logging setup used by hosts embedding
//! `ferrobpf-core` and by its test suites.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{
    init_file_logging, init_logging, init_logging_with_level, init_test_logging, LogFormat, LogLevel, LoggingError,
};
pub use tracing::{debug, error, info, trace, warn};
