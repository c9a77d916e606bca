//! Counters exported through the `metrics` facade.
//!
//! No recorder is installed by this crate; embedding applications choose one.

use metrics::counter;

pub fn record_call_issued(method: &'static str) {
    counter!("rootlink_calls_issued_total", "method" => method).increment(1);
}

pub fn record_call_timed_out() {
    counter!("rootlink_calls_timed_out_total").increment(1);
}

pub fn record_orphans_swept(count: u64) {
    counter!("rootlink_orphaned_calls_swept_total").increment(count);
}

pub fn record_reconnect_attempt() {
    counter!("rootlink_reconnect_attempts_total").increment(1);
}

pub fn record_audit_dropped() {
    counter!("rootlink_audit_entries_dropped_total").increment(1);
}

pub fn record_buffer_evicted() {
    counter!("rootlink_buffers_evicted_total").increment(1);
}
