//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `ROOTLINK_*` environment
//! variables with sensible defaults. Invalid values fall back to defaults
//! without crashing, and every value is clamped to a safe floor.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `ROOTLINK_SOCKET_PATH` | `/data/local/tmp/rootlink/rootlink.sock` | Companion socket |
//! | `ROOTLINK_STATE_DIR` | `$HOME/.rootlink` | Keys, instance id, audit log |
//! | `ROOTLINK_BUNDLED_BINARY` | `<state>/bin/rootlinkd` | Bundled companion binary |
//! | `ROOTLINK_INSTALLED_BINARY` | `/data/adb/rootlink/rootlinkd` | Installed companion binary |
//! | `ROOTLINK_SU_PATH` | `su` | Privileged shell |
//! | `ROOTLINK_CALL_TIMEOUT_MS` | 35000 | Hard bound per call (request timeout plus sweep grace) |
//! | `ROOTLINK_REQUEST_TIMEOUT_MS` | 30000 | Correlator deadline per call |
//! | `ROOTLINK_SWEEP_INTERVAL_MS` | 1000 | Orphan sweep interval |
//! | `ROOTLINK_SWEEP_GRACE_MS` | 5000 | Age beyond timeout before sweep |
//! | `ROOTLINK_BACKOFF_INITIAL_MS` | 500 | First reconnect delay |
//! | `ROOTLINK_BACKOFF_MAX_MS` | 30000 | Reconnect delay cap |
//! | `ROOTLINK_MAX_RECONNECTS` | 5 | Reconnect attempts before giving up |
//! | `ROOTLINK_PROTOCOL_VERSION` | 3 | Expected companion protocol |
//! | `ROOTLINK_MAX_BUFFERS` | 3 | Shared buffers held at once |
//! | `ROOTLINK_AUDIT_RATE_LIMIT` | 100 | Audit entries per window |
//! | `ROOTLINK_AUDIT_WINDOW_SECS` | 60 | Audit rate window |
//! | `ROOTLINK_AUDIT_MAX_SIZE` | 1048576 | Audit segment size (bytes) |
//! | `ROOTLINK_AUDIT_MAX_FILES` | 3 | Audit files kept, active included |
//! | `ROOTLINK_KEEP_ALIVE_SECS` | 0 | Idle stop of the companion (0 = off) |
//! | `ROOTLINK_PRESSURE_INTERVAL_SECS` | 5 | Memory pressure sampling (0 = off) |
//! | `ROOTLINK_ROTATION_THRESHOLD` | 1000 | Data messages per key generation |

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::audit::AuditConfig;
use crate::auth::{AuthenticatorConfig, KeyPaths};
use crate::buffer::BufferPoolConfig;
use crate::crypto::SecureChannelConfig;
use crate::ipc::{Backoff, CorrelatorConfig, TransportConfig, PROTOCOL_VERSION};
use crate::lifecycle::LifecycleConfig;
use crate::session::SessionConfig;

/// Effective runtime configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub socket_path: String,
    pub state_dir: String,
    pub installed_binary: String,
    pub call_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub sweep_grace_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnects: u32,
    pub protocol_version: u32,
    pub max_buffers: usize,
    pub audit_rate_limit: usize,
    pub audit_window_secs: u64,
    pub audit_max_size: u64,
    pub audit_max_files: usize,
    pub keep_alive_secs: u64,
    pub pressure_interval_secs: u64,
    pub rotation_threshold: u64,
}

/// All runtime configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    pub bundled_binary: PathBuf,
    pub installed_binary: PathBuf,
    pub su_path: PathBuf,
    pub transport: TransportConfig,
    pub correlator: CorrelatorConfig,
    pub lifecycle: LifecycleConfig,
    /// Idle period after which the companion is stopped.
    pub keep_alive: Option<Duration>,
    /// Interval between `/proc/meminfo` samples; None disables sampling.
    pub pressure_interval: Option<Duration>,
    pub pool: BufferPoolConfig,
    pub audit: AuditConfig,
    pub secure_channel: SecureChannelConfig,
    pub session: SessionConfig,
    pub auth: AuthenticatorConfig,
    pub key_paths: KeyPaths,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_path(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => PathBuf::from(val),
        _ => default(),
    }
}

fn default_state_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".rootlink"))
        .unwrap_or_else(|_| PathBuf::from(".rootlink"))
}

fn load_correlator_config() -> CorrelatorConfig {
    let request_ms = parse_u64("ROOTLINK_REQUEST_TIMEOUT_MS", 30_000).max(100);
    let sweep_ms = parse_u64("ROOTLINK_SWEEP_INTERVAL_MS", 1_000).max(10);
    let grace_ms = parse_u64("ROOTLINK_SWEEP_GRACE_MS", 5_000);
    CorrelatorConfig {
        request_timeout: Duration::from_millis(request_ms),
        sweep_interval: Duration::from_millis(sweep_ms),
        grace_period: Duration::from_millis(grace_ms),
        ..CorrelatorConfig::default()
    }
}

fn load_backoff() -> Backoff {
    let initial_ms = parse_u64("ROOTLINK_BACKOFF_INITIAL_MS", 500).max(10); // floor: 10ms
    let max_ms = parse_u64("ROOTLINK_BACKOFF_MAX_MS", 30_000).max(initial_ms);
    let max_attempts = parse_u32("ROOTLINK_MAX_RECONNECTS", 5).max(1);
    Backoff {
        initial: Duration::from_millis(initial_ms),
        max: Duration::from_millis(max_ms),
        max_attempts,
    }
}

fn load_audit_config(state_dir: &std::path::Path) -> AuditConfig {
    let rate_limit = parse_usize("ROOTLINK_AUDIT_RATE_LIMIT", 100).max(1);
    let window_secs = parse_u64("ROOTLINK_AUDIT_WINDOW_SECS", 60).max(1);
    let max_size = parse_u64("ROOTLINK_AUDIT_MAX_SIZE", 1024 * 1024).max(4096); // floor: 4 KiB
    let max_files = parse_usize("ROOTLINK_AUDIT_MAX_FILES", 3).max(1);
    AuditConfig {
        rate_limit,
        rate_window: Duration::from_secs(window_secs),
        log_path: Some(state_dir.join("audit.log")),
        max_log_size: max_size,
        max_rotated_files: max_files,
        ..AuditConfig::default()
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> LinkConfig {
    let state_dir = parse_path("ROOTLINK_STATE_DIR", default_state_dir);
    let socket_path = parse_path("ROOTLINK_SOCKET_PATH", || {
        PathBuf::from("/data/local/tmp/rootlink/rootlink.sock")
    });
    let bundled_binary = parse_path("ROOTLINK_BUNDLED_BINARY", || {
        state_dir.join("bin").join("rootlinkd")
    });
    let installed_binary = parse_path("ROOTLINK_INSTALLED_BINARY", || {
        PathBuf::from("/data/adb/rootlink/rootlinkd")
    });
    let su_path = parse_path("ROOTLINK_SU_PATH", || PathBuf::from("su"));

    let call_ms = parse_u64("ROOTLINK_CALL_TIMEOUT_MS", 35_000).max(100);
    let protocol_version = parse_u32("ROOTLINK_PROTOCOL_VERSION", PROTOCOL_VERSION).max(1);
    let max_buffers = parse_usize("ROOTLINK_MAX_BUFFERS", 3).max(2);
    let keep_alive_secs = parse_u64("ROOTLINK_KEEP_ALIVE_SECS", 0);
    let pressure_secs = parse_u64("ROOTLINK_PRESSURE_INTERVAL_SECS", 5);
    let rotation_threshold = parse_u64("ROOTLINK_ROTATION_THRESHOLD", 1000).max(1);

    LinkConfig {
        transport: TransportConfig {
            call_timeout: Duration::from_millis(call_ms),
            backoff: load_backoff(),
            client_version: protocol_version,
        },
        correlator: load_correlator_config(),
        lifecycle: LifecycleConfig {
            expected_version: protocol_version,
            ..LifecycleConfig::default()
        },
        keep_alive: (keep_alive_secs > 0).then(|| Duration::from_secs(keep_alive_secs)),
        pressure_interval: (pressure_secs > 0).then(|| Duration::from_secs(pressure_secs)),
        pool: BufferPoolConfig {
            max_buffers,
            ..BufferPoolConfig::default()
        },
        audit: load_audit_config(&state_dir),
        secure_channel: SecureChannelConfig { rotation_threshold },
        session: SessionConfig::default(),
        auth: AuthenticatorConfig::default(),
        key_paths: KeyPaths::default(),
        socket_path,
        state_dir,
        bundled_binary,
        installed_binary,
        su_path,
    }
}

impl LinkConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            socket_path: self.socket_path.display().to_string(),
            state_dir: self.state_dir.display().to_string(),
            installed_binary: self.installed_binary.display().to_string(),
            call_timeout_ms: self.transport.call_timeout.as_millis() as u64,
            request_timeout_ms: self.correlator.request_timeout.as_millis() as u64,
            sweep_interval_ms: self.correlator.sweep_interval.as_millis() as u64,
            sweep_grace_ms: self.correlator.grace_period.as_millis() as u64,
            backoff_initial_ms: self.transport.backoff.initial.as_millis() as u64,
            backoff_max_ms: self.transport.backoff.max.as_millis() as u64,
            max_reconnects: self.transport.backoff.max_attempts,
            protocol_version: self.lifecycle.expected_version,
            max_buffers: self.pool.max_buffers,
            audit_rate_limit: self.audit.rate_limit,
            audit_window_secs: self.audit.rate_window.as_secs(),
            audit_max_size: self.audit.max_log_size,
            audit_max_files: self.audit.max_rotated_files,
            keep_alive_secs: self.keep_alive.map_or(0, |d| d.as_secs()),
            pressure_interval_secs: self.pressure_interval.map_or(0, |d| d.as_secs()),
            rotation_threshold: self.secure_channel.rotation_threshold,
        }
    }
}
