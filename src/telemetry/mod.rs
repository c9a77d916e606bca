//! Telemetry for the rootlink runtime.
//!
//! Structured logging via `tracing`, call spans, and counters through the
//! `metrics` facade. Nothing here opens a network listener.

mod logging;
pub mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use spans::{CallSpan, SpanExt};
