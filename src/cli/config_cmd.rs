// Copyright 2024-2026 rootlink Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults, validate.
//!
//! These commands read configuration directly from environment variables
//! without contacting the companion.

use crate::config::{self, EffectiveConfig};

/// Print effective config as key-value pairs to stdout.
pub fn run_show() {
    let cfg = config::load().effective();
    print_config(&cfg);
}

/// Print effective config as JSON to stdout.
pub fn run_show_json() -> i32 {
    match serde_json::to_string_pretty(&config::load().effective()) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("Failed to serialize configuration: {e}");
            1
        }
    }
}

/// Print default config values (no env overrides) to stdout.
pub fn run_defaults() {
    println!("ROOTLINK_SOCKET_PATH=/data/local/tmp/rootlink/rootlink.sock");
    println!("ROOTLINK_STATE_DIR=$HOME/.rootlink");
    println!("ROOTLINK_INSTALLED_BINARY=/data/adb/rootlink/rootlinkd");
    println!("ROOTLINK_SU_PATH=su");
    println!("ROOTLINK_CALL_TIMEOUT_MS=35000");
    println!("ROOTLINK_REQUEST_TIMEOUT_MS=30000");
    println!("ROOTLINK_SWEEP_INTERVAL_MS=1000");
    println!("ROOTLINK_SWEEP_GRACE_MS=5000");
    println!("ROOTLINK_BACKOFF_INITIAL_MS=500");
    println!("ROOTLINK_BACKOFF_MAX_MS=30000");
    println!("ROOTLINK_MAX_RECONNECTS=5");
    println!("ROOTLINK_PROTOCOL_VERSION={}", crate::ipc::PROTOCOL_VERSION);
    println!("ROOTLINK_MAX_BUFFERS=3");
    println!("ROOTLINK_AUDIT_RATE_LIMIT=100");
    println!("ROOTLINK_AUDIT_WINDOW_SECS=60");
    println!("ROOTLINK_AUDIT_MAX_SIZE=1048576");
    println!("ROOTLINK_AUDIT_MAX_FILES=3");
    println!("ROOTLINK_KEEP_ALIVE_SECS=0");
    println!("ROOTLINK_PRESSURE_INTERVAL_SECS=5");
    println!("ROOTLINK_ROTATION_THRESHOLD=1000");
}

/// Validate configuration for obvious misconfigurations.
///
/// Returns 0 if valid, 1 if any warnings are found.
pub fn run_validate() -> i32 {
    let cfg = config::load();
    let warnings = validate(&cfg);
    for warning in &warnings {
        eprintln!("WARNING: {warning}");
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn validate(cfg: &config::LinkConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if !cfg.bundled_binary.exists() {
        warnings.push(format!(
            "ROOTLINK_BUNDLED_BINARY ({}) does not exist; the companion cannot be deployed",
            cfg.bundled_binary.display()
        ));
    }

    if cfg.transport.call_timeout < cfg.correlator.request_timeout {
        warnings.push(format!(
            "ROOTLINK_CALL_TIMEOUT_MS ({}) is below ROOTLINK_REQUEST_TIMEOUT_MS ({}); \
             calls give up at the call timeout",
            cfg.transport.call_timeout.as_millis(),
            cfg.correlator.request_timeout.as_millis()
        ));
    }

    if let Some(idle) = cfg.keep_alive {
        if idle.as_secs() < 10 {
            warnings.push(format!(
                "ROOTLINK_KEEP_ALIVE_SECS ({}) is very short; the companion will restart often",
                idle.as_secs()
            ));
        }
    }

    warnings
}

fn print_config(cfg: &EffectiveConfig) {
    println!("ROOTLINK_SOCKET_PATH={}", cfg.socket_path);
    println!("ROOTLINK_STATE_DIR={}", cfg.state_dir);
    println!("ROOTLINK_INSTALLED_BINARY={}", cfg.installed_binary);
    println!("ROOTLINK_CALL_TIMEOUT_MS={}", cfg.call_timeout_ms);
    println!("ROOTLINK_REQUEST_TIMEOUT_MS={}", cfg.request_timeout_ms);
    println!("ROOTLINK_SWEEP_INTERVAL_MS={}", cfg.sweep_interval_ms);
    println!("ROOTLINK_SWEEP_GRACE_MS={}", cfg.sweep_grace_ms);
    println!("ROOTLINK_BACKOFF_INITIAL_MS={}", cfg.backoff_initial_ms);
    println!("ROOTLINK_BACKOFF_MAX_MS={}", cfg.backoff_max_ms);
    println!("ROOTLINK_MAX_RECONNECTS={}", cfg.max_reconnects);
    println!("ROOTLINK_PROTOCOL_VERSION={}", cfg.protocol_version);
    println!("ROOTLINK_MAX_BUFFERS={}", cfg.max_buffers);
    println!("ROOTLINK_AUDIT_RATE_LIMIT={}", cfg.audit_rate_limit);
    println!("ROOTLINK_AUDIT_WINDOW_SECS={}", cfg.audit_window_secs);
    println!("ROOTLINK_AUDIT_MAX_SIZE={}", cfg.audit_max_size);
    println!("ROOTLINK_AUDIT_MAX_FILES={}", cfg.audit_max_files);
    println!("ROOTLINK_KEEP_ALIVE_SECS={}", cfg.keep_alive_secs);
    println!("ROOTLINK_PRESSURE_INTERVAL_SECS={}", cfg.pressure_interval_secs);
    println!("ROOTLINK_ROTATION_THRESHOLD={}", cfg.rotation_threshold);
}
