//! Companion binary verification and deployment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};

use super::runner::{shell_quote, CommandOutcome, PrivilegedRunner};
use crate::error::{DeploymentError, Result};

/// Where the companion binary comes from and where it is installed.
#[derive(Debug, Clone)]
pub struct BinarySource {
    /// Bundled copy readable by this process.
    pub bundled: PathBuf,
    /// Root-owned install location.
    pub installed: PathBuf,
}

/// Verifies and deploys the companion executable through the runner.
pub struct BinaryDeployer {
    runner: Arc<dyn PrivilegedRunner>,
    source: BinarySource,
    command_timeout: Duration,
}

fn digest_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^([0-9a-fA-F]{64})\b").ok())
        .as_ref()
}

fn version_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)protocol[\s:=v]*(\d+)").ok())
        .as_ref()
}

/// Parse the protocol version from `--version` output.
pub fn parse_protocol_version(output: &str) -> Option<u32> {
    version_pattern()?
        .captures(output)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

impl BinaryDeployer {
    pub fn new(
        runner: Arc<dyn PrivilegedRunner>,
        source: BinarySource,
        command_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            source,
            command_timeout,
        }
    }

    pub fn installed_path(&self) -> &Path {
        &self.source.installed
    }

    /// SHA-256 of the bundled binary, hex encoded.
    pub async fn bundled_digest(&self) -> Result<String> {
        let bytes = tokio::fs::read(&self.source.bundled).await.map_err(|e| {
            DeploymentError::BinaryMissing(format!("{}: {e}", self.source.bundled.display()))
        })?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// SHA-256 of the installed binary, or None if it is absent.
    pub async fn installed_digest(&self) -> Result<Option<String>> {
        let installed = shell_quote(&self.source.installed.to_string_lossy());
        let command = format!("sha256sum {installed}");
        match self.runner.execute(&command, self.command_timeout).await {
            CommandOutcome::Success { output, .. } => Ok(digest_pattern()
                .and_then(|re| re.captures(output.trim()))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_ascii_lowercase())),
            CommandOutcome::Error { .. } => Ok(None),
            CommandOutcome::AccessDenied { reason } => {
                Err(DeploymentError::PermissionError(reason).into())
            }
            CommandOutcome::Timeout => {
                Err(DeploymentError::PermissionError("digest check timed out".into()).into())
            }
        }
    }

    /// Whether the installed binary matches the bundled one.
    pub async fn verify(&self) -> Result<bool> {
        let bundled = self.bundled_digest().await?;
        Ok(self.installed_digest().await?.as_deref() == Some(bundled.as_str()))
    }

    /// Protocol version reported by the installed binary's `--version`.
    pub async fn installed_version(&self) -> Option<u32> {
        let installed = shell_quote(&self.source.installed.to_string_lossy());
        let command = format!("{installed} --version");
        let outcome = self.runner.execute(&command, self.command_timeout).await;
        outcome.output().and_then(parse_protocol_version)
    }

    /// Install the bundled binary. Skipped when already current unless
    /// `force` is set.
    pub async fn deploy(&self, force: bool) -> Result<()> {
        if !force && self.verify().await? {
            tracing::debug!("companion binary already current");
            return Ok(());
        }

        let src = shell_quote(&self.source.bundled.to_string_lossy());
        let dst = shell_quote(&self.source.installed.to_string_lossy());
        let command = format!("cp {src} {dst} && chmod 755 {dst} && chown root:root {dst}");
        match self.runner.execute(&command, self.command_timeout).await {
            CommandOutcome::Success { .. } => {}
            CommandOutcome::Error { message, stderr } => {
                let detail = format!("{message}: {}", stderr.trim());
                return Err(DeploymentError::PermissionError(detail).into());
            }
            CommandOutcome::AccessDenied { reason } => {
                return Err(DeploymentError::PermissionError(reason).into());
            }
            CommandOutcome::Timeout => {
                return Err(DeploymentError::PermissionError("deploy timed out".into()).into());
            }
        }

        if !self.verify().await? {
            return Err(DeploymentError::PermissionError(
                "installed binary digest does not match after deploy".into(),
            )
            .into());
        }
        tracing::info!(path = %self.source.installed.display(), force, "companion binary deployed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocol_version() {
        assert_eq!(parse_protocol_version("rootlinkd 0.3.0 (protocol 3)"), Some(3));
        assert_eq!(parse_protocol_version("Protocol: v12"), Some(12));
        assert_eq!(parse_protocol_version("rootlinkd 0.3.0"), None);
    }

    #[test]
    fn test_digest_pattern() {
        let line = format!("{}  /data/local/rootlinkd", "a".repeat(64));
        let caps = digest_pattern().and_then(|re| re.captures(&line)).unwrap();
        assert_eq!(caps.get(1).unwrap().as_str().len(), 64);
    }
}
