//! IPC layer for the rootlink client.
//!
//! Wire protocol, request correlation, the local-socket channel, and the
//! transport that owns the companion connection and reconnects it.

mod backoff;
mod channel;
mod correlator;
pub mod protocol;
mod socket;
mod transport;

pub use backoff::Backoff;
pub use channel::{ChannelFault, Connector, IpcChannel};
pub use correlator::{CallTimeout, CorrelatorConfig, RequestCorrelator};
pub use protocol::{
    BufferDescriptor, CallId, Capabilities, Frame, ProtocolError, Push, Request, Response,
    SessionBinding, StatusUpdate, SystemStatus, PROTOCOL_VERSION,
};
pub use socket::{FramedChannel, LocalSocketConnector};
pub use transport::{
    ConnectOutcome, LinkStatus, RpcExecutor, Transport, TransportConfig, TransportEvent,
};
