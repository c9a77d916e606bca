//! Privileged command execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::DeploymentError;

/// Output kept per stream.
const MAX_OUTPUT: usize = 64 * 1024;

/// Result of one privileged command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success { exit_code: i32, output: String },
    Error { message: String, stderr: String },
    Timeout,
    AccessDenied { reason: String },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Trimmed stdout of a successful command.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Success { output, .. } => Some(output.trim()),
            _ => None,
        }
    }
}

/// Whether elevated execution is possible at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootAvailability {
    Available,
    Unavailable(String),
    /// Root exists but a security policy (SELinux, a su manager) refused.
    PolicyDenied(String),
}

/// Runs shell commands with elevated privileges.
#[async_trait]
pub trait PrivilegedRunner: Send + Sync {
    async fn execute(&self, command: &str, timeout: Duration) -> CommandOutcome;

    async fn availability(&self) -> RootAvailability {
        match self.execute("id -u", Duration::from_secs(5)).await {
            CommandOutcome::Success { output, .. } if output.trim() == "0" => {
                RootAvailability::Available
            }
            CommandOutcome::Success { output, .. } => RootAvailability::Unavailable(format!(
                "elevated shell runs as uid {}",
                output.trim()
            )),
            CommandOutcome::AccessDenied { reason } if is_policy_denial(&reason) => {
                RootAvailability::PolicyDenied(reason)
            }
            CommandOutcome::AccessDenied { reason } => RootAvailability::Unavailable(reason),
            CommandOutcome::Error { message, .. } => RootAvailability::Unavailable(message),
            CommandOutcome::Timeout => RootAvailability::Unavailable("root check timed out".into()),
        }
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Deployment error for a command the elevated shell refused.
pub(crate) fn denial_error(reason: String) -> DeploymentError {
    if is_policy_denial(&reason) {
        DeploymentError::PolicyDenied(reason)
    } else {
        DeploymentError::RootUnavailable(reason)
    }
}

fn is_policy_denial(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("avc: denied") || lower.contains("selinux") || lower.contains("policy")
}

fn is_access_denial(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("permission denied") || lower.contains("not allowed") || is_policy_denial(&lower)
}

fn bounded(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_OUTPUT)]).into_owned()
}

/// Runs commands through `su -c`.
#[derive(Debug, Clone)]
pub struct SuRunner {
    su_path: PathBuf,
}

impl Default for SuRunner {
    fn default() -> Self {
        Self {
            su_path: PathBuf::from("su"),
        }
    }
}

impl SuRunner {
    pub fn new(su_path: impl Into<PathBuf>) -> Self {
        Self {
            su_path: su_path.into(),
        }
    }
}

#[async_trait]
impl PrivilegedRunner for SuRunner {
    async fn execute(&self, command: &str, timeout: Duration) -> CommandOutcome {
        let mut cmd = Command::new(&self.su_path);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CommandOutcome::AccessDenied {
                    reason: format!("{} not found", self.su_path.display()),
                };
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return CommandOutcome::AccessDenied { reason: e.to_string() };
            }
            Err(e) => {
                return CommandOutcome::Error {
                    message: format!("failed to spawn su: {e}"),
                    stderr: String::new(),
                };
            }
        };

        // Dropping the child on timeout kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return CommandOutcome::Error {
                    message: e.to_string(),
                    stderr: String::new(),
                };
            }
            Err(_) => {
                tracing::warn!(command, ?timeout, "privileged command timed out");
                return CommandOutcome::Timeout;
            }
        };

        let stdout = bounded(&output.stdout);
        let stderr = bounded(&output.stderr);
        match output.status.code() {
            Some(0) => CommandOutcome::Success {
                exit_code: 0,
                output: stdout,
            },
            _ if is_access_denial(&stderr) => CommandOutcome::AccessDenied { reason: stderr },
            Some(code) => CommandOutcome::Error {
                message: format!("exit code {code}"),
                stderr,
            },
            None => CommandOutcome::Error {
                message: "terminated by signal".into(),
                stderr,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/bin"), "'/data/bin'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_denial_detection() {
        assert!(is_access_denial("su: Permission denied"));
        assert!(is_policy_denial("avc: denied { execute }"));
        assert!(!is_access_denial("No such file"));
    }

    #[tokio::test]
    async fn test_missing_su_is_access_denied() {
        let runner = SuRunner::new("/nonexistent/su-binary");
        let outcome = runner.execute("true", Duration::from_secs(1)).await;
        assert!(matches!(outcome, CommandOutcome::AccessDenied { .. }));
        assert!(matches!(runner.availability().await, RootAvailability::Unavailable(_)));
    }
}
