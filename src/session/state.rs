//! Observable session state and the events published alongside it.

use chrono::{DateTime, Utc};

use crate::error::LinkError;
use crate::ipc::Capabilities;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Connecting,
    Authenticating,
    Reconciling,
    Ready {
        protocol_version: u32,
        capabilities: Capabilities,
    },
    Error {
        message: String,
        code: i32,
        recoverable: bool,
    },
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Whether an establish or re-establish sequence is underway.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Connecting | Self::Authenticating | Self::Reconciling
        )
    }

    pub fn from_error(error: &LinkError) -> Self {
        Self::Error {
            message: error.to_string(),
            code: error.code(),
            recoverable: error.is_recoverable(),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Connecting => write!(f, "connecting"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Ready {
                protocol_version, ..
            } => write!(f, "ready (protocol {protocol_version})"),
            Self::Error { message, code, .. } => write!(f, "error {code}: {message}"),
        }
    }
}

/// Published for every failure that moves the session to Error.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub code: i32,
    pub message: String,
    pub recoverable: bool,
}

impl From<&LinkError> for ErrorEvent {
    fn from(error: &LinkError) -> Self {
        Self {
            timestamp: Utc::now(),
            code: error.code(),
            message: error.to_string(),
            recoverable: error.is_recoverable(),
        }
    }
}

/// Companion request to give a shared buffer back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferReleaseRequest {
    pub buffer_id: u64,
    pub timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;

    #[test]
    fn test_error_state_carries_recoverability() {
        let err = LinkError::from(ConnectionError::ReconnectionExhausted { attempts: 5 });
        match SessionState::from_error(&err) {
            SessionState::Error { code, recoverable, .. } => {
                assert_eq!(code, 104);
                assert!(!recoverable);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_transitional_states() {
        assert!(SessionState::Reconciling.is_transitional());
        assert!(!SessionState::Stopped.is_transitional());
        assert!(!SessionState::Ready {
            protocol_version: 3,
            capabilities: Capabilities::default()
        }
        .is_transitional());
    }
}
