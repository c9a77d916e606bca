//! Span utilities for companion RPC tracing.

use tracing::{debug_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for standardized companion call spans.
pub struct CallSpan;

impl CallSpan {
    /// Create a span for one companion call.
    ///
    /// `status` and `error.message` are filled in by `SpanExt::record_result`.
    pub fn new(method: &'static str) -> Span {
        debug_span!(
            "companion_call",
            method = method,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
