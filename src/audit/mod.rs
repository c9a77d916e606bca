//! Security audit trail for session events.
//!
//! Provides rate-limited, append-only audit logging:
//! - Structured entries with event type, severity, uid and pid
//! - Rolling-window rate limit; excess entries are dropped silently
//! - In-memory ring of recent entries plus a live entry stream
//! - Asynchronous persistence to a size-rotated JSON-lines file
//!
//! Details are truncated and scrubbed of long hex/base64 runs before they are
//! stored, so key material never reaches the log.

mod rotation;

pub use rotation::RotatingFile;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::observe::EventStream;
use crate::telemetry::metrics;

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord)]
pub enum AuditSeverity {
    Info = 0,
    Warning = 1,
    Critical = 2,
}

impl std::fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditSeverity::Info => write!(f, "INFO"),
            AuditSeverity::Warning => write!(f, "WARNING"),
            AuditSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Audited session and authentication events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    AuthSuccess,
    AuthFailure,
    ChallengeFailed,
    SignatureInvalid,
    AttestationFailed,
    KeyNotFound,
    KeyDeployed,
    KeyDeploymentFailed,
    ReplayRejected,
    SessionCreated,
    SessionResumed,
    SessionConflict,
    SessionDestroyed,
    ChannelEstablished,
    KeysRotated,
    DecryptFailed,
    DaemonStarted,
    DaemonStopped,
    DaemonStopFailed,
    VersionMismatch,
    PeerDied,
    OperationRejected,
}

impl AuditEventType {
    pub fn severity(self) -> AuditSeverity {
        match self {
            Self::AuthSuccess
            | Self::KeyDeployed
            | Self::SessionCreated
            | Self::SessionResumed
            | Self::SessionDestroyed
            | Self::ChannelEstablished
            | Self::KeysRotated
            | Self::DaemonStarted
            | Self::DaemonStopped => AuditSeverity::Info,
            Self::ChallengeFailed
            | Self::KeyNotFound
            | Self::KeyDeploymentFailed
            | Self::SessionConflict
            | Self::DaemonStopFailed
            | Self::VersionMismatch
            | Self::PeerDied => AuditSeverity::Warning,
            Self::AuthFailure
            | Self::SignatureInvalid
            | Self::AttestationFailed
            | Self::ReplayRejected
            | Self::DecryptFailed
            | Self::OperationRejected => AuditSeverity::Critical,
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AuthSuccess => "AUTH_SUCCESS",
            Self::AuthFailure => "AUTH_FAILURE",
            Self::ChallengeFailed => "CHALLENGE_FAILED",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::AttestationFailed => "ATTESTATION_FAILED",
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::KeyDeployed => "KEY_DEPLOYED",
            Self::KeyDeploymentFailed => "KEY_DEPLOYMENT_FAILED",
            Self::ReplayRejected => "REPLAY_REJECTED",
            Self::SessionCreated => "SESSION_CREATED",
            Self::SessionResumed => "SESSION_RESUMED",
            Self::SessionConflict => "SESSION_CONFLICT",
            Self::SessionDestroyed => "SESSION_DESTROYED",
            Self::ChannelEstablished => "CHANNEL_ESTABLISHED",
            Self::KeysRotated => "KEYS_ROTATED",
            Self::DecryptFailed => "DECRYPT_FAILED",
            Self::DaemonStarted => "DAEMON_STARTED",
            Self::DaemonStopped => "DAEMON_STOPPED",
            Self::DaemonStopFailed => "DAEMON_STOP_FAILED",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::PeerDied => "PEER_DIED",
            Self::OperationRejected => "OPERATION_REJECTED",
        };
        f.write_str(name)
    }
}

/// One audit record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub uid: u32,
    pub pid: u32,
    pub details: String,
}

impl AuditLogEntry {
    /// Convert to log-friendly string
    pub fn to_log_string(&self) -> String {
        format!(
            "[{}] {} {} uid={} pid={} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.severity,
            self.event_type,
            self.uid,
            self.pid,
            self.details
        )
    }
}

/// Audit log configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Accepted entries per window
    pub rate_limit: usize,
    pub rate_window: Duration,
    /// Entries kept in memory
    pub ring_capacity: usize,
    /// Persisted log; memory only when unset
    pub log_path: Option<PathBuf>,
    /// Segment size that triggers rotation
    pub max_log_size: u64,
    /// Files kept on disk, active segment included
    pub max_rotated_files: usize,
    pub max_detail_len: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
            ring_capacity: 256,
            log_path: None,
            max_log_size: 1024 * 1024,
            max_rotated_files: 3,
            max_detail_len: 512,
        }
    }
}

/// Queue depth between loggers and the file writer.
const WRITER_QUEUE: usize = 1024;

enum WriterMsg {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Rate-limited audit log.
pub struct AuditLog {
    config: AuditConfig,
    enabled: AtomicBool,
    window: Mutex<VecDeque<Instant>>,
    ring: Mutex<VecDeque<AuditLogEntry>>,
    entries: EventStream<AuditLogEntry>,
    writer: Mutex<Option<mpsc::Sender<WriterMsg>>>,
    dropped: AtomicU64,
    uid: u32,
    pid: u32,
}

impl AuditLog {
    /// Create an audit log. With `log_path` set this spawns the file writer
    /// and must be called inside a tokio runtime.
    pub fn new(config: AuditConfig) -> Self {
        let writer = config.log_path.clone().map(|path| {
            let (tx, rx) = mpsc::channel(WRITER_QUEUE);
            let file = RotatingFile::new(path, config.max_log_size, config.max_rotated_files);
            tokio::spawn(writer_loop(file, rx));
            tx
        });

        Self {
            enabled: AtomicBool::new(config.enabled),
            window: Mutex::new(VecDeque::new()),
            ring: Mutex::new(VecDeque::with_capacity(config.ring_capacity)),
            entries: EventStream::default(),
            writer: Mutex::new(writer),
            dropped: AtomicU64::new(0),
            uid: current_uid(),
            pid: std::process::id(),
            config,
        }
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self::new(AuditConfig {
            enabled: false,
            ..AuditConfig::default()
        })
    }

    /// Record an event. Returns false when the entry was dropped because
    /// logging is disabled or the rate limit is exhausted.
    pub fn log(&self, event_type: AuditEventType, details: impl AsRef<str>) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        if !self.admit() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_audit_dropped();
            return false;
        }

        let entry = AuditLogEntry {
            timestamp: Utc::now(),
            event_type,
            severity: event_type.severity(),
            uid: self.uid,
            pid: self.pid,
            details: sanitize_details(details.as_ref(), self.config.max_detail_len),
        };
        tracing::debug!(event = %entry.event_type, "audit entry recorded");

        {
            let mut ring = self.ring.lock();
            if ring.len() >= self.config.ring_capacity.max(1) {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }

        if let Some(tx) = self.writer.lock().as_ref() {
            match file_line(&entry, self.config.max_log_size) {
                Ok(line) => {
                    if tx.try_send(WriterMsg::Line(line)).is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::record_audit_dropped();
                    }
                }
                Err(e) => tracing::warn!(error = %e, "audit entry not serializable"),
            }
        }

        self.entries.publish(entry);
        true
    }

    /// Rolling-window admission check.
    fn admit(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.config.rate_window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.config.rate_limit {
            return false;
        }
        window.push_back(now);
        true
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Recent entries, oldest first.
    pub fn recent(&self) -> Vec<AuditLogEntry> {
        self.ring.lock().iter().cloned().collect()
    }

    /// Entries dropped by the rate limit or a full writer queue.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditLogEntry> {
        self.entries.subscribe()
    }

    /// Wait until every accepted entry has reached the file.
    pub async fn flush(&self) {
        let tx = self.writer.lock().clone();
        if let Some(tx) = tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(WriterMsg::Flush(ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            }
        }
    }

    /// Flush and stop the file writer. Later entries stay in memory only.
    pub async fn close(&self) {
        self.flush().await;
        self.writer.lock().take();
    }
}

async fn writer_loop(mut file: RotatingFile, mut rx: mpsc::Receiver<WriterMsg>) {
    let mut failing = false;
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Line(mut line) => {
                line.push('\n');
                match file.append(line.as_bytes()).await {
                    Ok(()) => failing = false,
                    Err(e) => {
                        if !failing {
                            tracing::warn!(error = %e, "audit log write failed");
                        }
                        failing = true;
                    }
                }
            }
            WriterMsg::Flush(ack) => {
                if let Err(e) = file.flush().await {
                    tracing::warn!(error = %e, "audit log flush failed");
                }
                let _ = ack.send(());
            }
        }
    }
    let _ = file.flush().await;
}

fn redaction_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"\b[0-9a-fA-F]{32,}\b", r"[A-Za-z0-9+/]{40,}={0,2}"]
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// Truncate to `max_len` bytes on a char boundary and redact long key-like
/// runs.
pub fn sanitize_details(details: &str, max_len: usize) -> String {
    let mut cut = details.len().min(max_len);
    while !details.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = details[..cut].to_string();
    for pattern in redaction_patterns() {
        out = pattern.replace_all(&out, "[REDACTED]").into_owned();
    }
    if cut < details.len() {
        out.push_str("...");
    }
    out
}

/// Serialize `entry` so the record and its newline fit one log segment,
/// shortening the details when they do not.
fn file_line(entry: &AuditLogEntry, max_size: u64) -> serde_json::Result<String> {
    let limit = usize::try_from(max_size).unwrap_or(usize::MAX).saturating_sub(1);
    let line = serde_json::to_string(entry)?;
    if line.len() <= limit {
        return Ok(line);
    }
    let excess = line.len() - limit;
    let mut shortened = entry.clone();
    let keep = entry.details.len().saturating_sub(excess + 3);
    shortened.details = sanitize_details(&entry.details, keep);
    serde_json::to_string(&shortened)
}

#[cfg(unix)]
fn current_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0)
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(AuditSeverity::Critical > AuditSeverity::Warning);
        assert!(AuditSeverity::Warning > AuditSeverity::Info);
        assert_eq!(AuditEventType::SignatureInvalid.severity(), AuditSeverity::Critical);
    }

    #[test]
    fn test_event_type_display_matches_serde() {
        let json = serde_json::to_string(&AuditEventType::SessionCreated).unwrap();
        assert_eq!(json, format!("\"{}\"", AuditEventType::SessionCreated));
    }

    #[test]
    fn test_redacts_key_material() {
        let key = "ab".repeat(32);
        let out = sanitize_details(&format!("fingerprint {key} deployed"), 512);
        assert!(!out.contains(&key));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        let out = sanitize_details("ééééé", 3);
        assert_eq!(out, "é...");
    }

    #[tokio::test]
    async fn test_disabled_drops() {
        let log = AuditLog::disabled();
        assert!(!log.log(AuditEventType::AuthSuccess, "x"));
        assert!(log.recent().is_empty());
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest() {
        let log = AuditLog::new(AuditConfig {
            ring_capacity: 2,
            ..AuditConfig::default()
        });
        log.log(AuditEventType::DaemonStarted, "1");
        log.log(AuditEventType::DaemonStarted, "2");
        log.log(AuditEventType::DaemonStarted, "3");
        let details: Vec<_> = log.recent().into_iter().map(|e| e.details).collect();
        assert_eq!(details, vec!["2", "3"]);
    }

    #[test]
    fn test_log_string() {
        let entry = AuditLogEntry {
            timestamp: Utc::now(),
            event_type: AuditEventType::SessionDestroyed,
            severity: AuditSeverity::Info,
            uid: 1000,
            pid: 42,
            details: "client gone".into(),
        };
        let line = entry.to_log_string();
        assert!(line.contains("SESSION_DESTROYED"));
        assert!(line.contains("uid=1000"));
        assert!(line.contains("client gone"));
    }
}
