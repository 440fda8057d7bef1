//! Docketflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Process-wide plumbing shared by the docketflow binaries.
//!
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
