//! Seams between the transport and a concrete IPC mechanism.
//!
//! A [`Connector`] knows how to find and open the companion's endpoint; an
//! [`IpcChannel`] is one live connection. Faults are reported raw and
//! classified by the transport.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::correlator::RequestCorrelator;
use super::protocol::{Push, Request, Response};

/// Raw failure of a channel operation, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFault {
    /// The endpoint does not exist (companion not running).
    NotFound,
    /// The connection is closed or the reader observed EOF.
    Closed,
    /// An IO error with its kind and, when available, the OS error code.
    Io {
        kind: io::ErrorKind,
        os_code: Option<i32>,
        message: String,
    },
    /// The correlator deadline elapsed.
    TimedOut(Duration),
    /// Malformed frame from the peer.
    Protocol(String),
    /// The runtime is shutting down.
    Shutdown,
}

impl From<io::Error> for ChannelFault {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            kind => Self::Io {
                kind,
                os_code: e.raw_os_error(),
                message: e.to_string(),
            },
        }
    }
}

/// One live connection to the companion.
#[async_trait]
pub trait IpcChannel: Send + Sync {
    /// Send a request and wait for its reply, bounded by `timeout`.
    async fn call(&self, request: Request, timeout: Duration) -> Result<Response, ChannelFault>;

    /// Cheap local check: has the connection been observed dead?
    fn is_alive(&self) -> bool;

    /// Independent liveness probe that does not share the failing call's
    /// resources. Returns false if the peer is gone.
    async fn probe(&self) -> bool;

    /// Resolves once the connection is dead.
    async fn closed(&self);

    /// Unsolicited messages from the companion on this connection.
    fn pushes(&self) -> broadcast::Receiver<Push>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Finds and opens the companion endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Whether the companion endpoint is currently discoverable.
    async fn is_discoverable(&self) -> bool;

    /// Open a new connection. Replies are routed through `correlator`.
    async fn open(
        &self,
        correlator: Arc<RequestCorrelator>,
    ) -> Result<Arc<dyn IpcChannel>, ChannelFault>;
}

impl ChannelFault {
    /// Whether this fault means the peer is gone rather than busy.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::NotFound | Self::Closed | Self::Shutdown => true,
            Self::Io { kind, .. } => matches!(
                kind,
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            Self::TimedOut(_) | Self::Protocol(_) => false,
        }
    }
}
