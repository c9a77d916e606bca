//! Length-prefixed frame channel over a local socket.
//!
//! One reader task per connection routes replies into the shared
//! [`RequestCorrelator`] and unsolicited pushes into a broadcast stream. When
//! the reader hits EOF or an IO error every pending call fails with PeerDied.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use interprocess::local_socket::tokio::{prelude::*, SendHalf, Stream};
use interprocess::local_socket::GenericFilePath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use super::channel::{ChannelFault, Connector, IpcChannel};
use super::correlator::RequestCorrelator;
use super::protocol::{
    decode_frame, decode_frame_len, encode_frame, Frame, Push, Request, Response,
    FRAME_HEADER_SIZE,
};
use crate::error::{ConnectionError, LinkError};
use crate::observe::EventStream;

/// Timeout for the liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens the companion's local socket.
#[derive(Debug, Clone)]
pub struct LocalSocketConnector {
    path: PathBuf,
}

impl LocalSocketConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Connector for LocalSocketConnector {
    async fn is_discoverable(&self) -> bool {
        tokio::fs::metadata(&self.path).await.is_ok()
    }

    async fn open(
        &self,
        correlator: Arc<RequestCorrelator>,
    ) -> Result<Arc<dyn IpcChannel>, ChannelFault> {
        let name = self.path.as_path().to_fs_name::<GenericFilePath>()?;
        let stream = Stream::connect(name).await?;
        let (recv, send) = stream.split();
        let channel: Arc<FramedChannel<SendHalf>> = FramedChannel::start(recv, send, correlator);
        Ok(channel)
    }
}

/// State shared between a channel and its reader task.
struct Shared {
    correlator: Arc<RequestCorrelator>,
    pushes: EventStream<Push>,
    alive: AtomicBool,
    dead: CancellationToken,
}

impl Shared {
    /// Mark the connection dead. Returns true for the first caller only.
    fn mark_dead(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        self.dead.cancel();
        was_alive
    }
}

/// Frame channel over any async byte stream pair.
pub struct FramedChannel<W> {
    writer: Mutex<W>,
    shared: Arc<Shared>,
}

impl<W> FramedChannel<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a connected stream and start its reader task.
    pub fn start<R>(reader: R, writer: W, correlator: Arc<RequestCorrelator>) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            correlator,
            pushes: EventStream::default(),
            alive: AtomicBool::new(true),
            dead: CancellationToken::new(),
        });
        tokio::spawn(reader_loop(reader, Arc::clone(&shared)));
        Arc::new(Self {
            writer: Mutex::new(writer),
            shared,
        })
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), ChannelFault> {
        let bytes = encode_frame(frame).map_err(|e| ChannelFault::Protocol(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> IpcChannel for FramedChannel<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn call(&self, request: Request, timeout: Duration) -> Result<Response, ChannelFault> {
        if !self.is_alive() {
            return Err(ChannelFault::Closed);
        }

        let mut write_fault: Option<ChannelFault> = None;
        let fault_slot = &mut write_fault;
        let result = self
            .shared
            .correlator
            .issue(
                timeout,
                |id| async move {
                    let frame = Frame::Call { id, request };
                    match self.write_frame(&frame).await {
                        Ok(()) => Ok(()),
                        Err(fault) => {
                            *fault_slot = Some(fault);
                            Err(LinkError::Cancelled)
                        }
                    }
                },
                Ok,
            )
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(e) => Err(write_fault.unwrap_or_else(|| fault_from_link(e))),
        }
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    async fn probe(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.call(Request::Ping, PROBE_TIMEOUT).await {
            Ok(_) => true,
            Err(fault) => !fault.is_disconnect(),
        }
    }

    async fn closed(&self) {
        self.shared.dead.cancelled().await;
    }

    fn pushes(&self) -> broadcast::Receiver<Push> {
        self.shared.pushes.subscribe()
    }

    async fn close(&self) {
        if self.shared.mark_dead() {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
            tracing::debug!("socket channel closed locally");
        }
    }
}

/// Map a correlator failure back onto the raw fault vocabulary.
fn fault_from_link(error: LinkError) -> ChannelFault {
    match error {
        LinkError::Connection(ConnectionError::Timeout(d)) => ChannelFault::TimedOut(d),
        LinkError::Connection(ConnectionError::PeerDied) => ChannelFault::Closed,
        LinkError::Connection(ConnectionError::NotConnected) => ChannelFault::Closed,
        LinkError::Closed | LinkError::Cancelled => ChannelFault::Shutdown,
        other => ChannelFault::Protocol(other.to_string()),
    }
}

/// Read one frame. The outer error is fatal for the connection; the inner
/// one means the body failed to decode but the stream is still in sync.
async fn read_frame<R>(reader: &mut R) -> Result<Result<Frame, String>, ChannelFault>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = decode_frame_len(header).map_err(|e| ChannelFault::Protocol(e.to_string()))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(decode_frame(&body).map_err(|e| e.to_string()))
}

async fn reader_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            () = shared.dead.cancelled() => return,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Ok(Frame::Reply { id, response })) => {
                shared.correlator.resolve(id, response);
            }
            Ok(Ok(Frame::Push { push })) => {
                shared.pushes.publish(push);
            }
            Ok(Ok(Frame::Call { id, .. })) => {
                tracing::warn!(call_id = id, "companion sent a call frame; ignored");
            }
            Ok(Err(msg)) => {
                tracing::warn!(error = %msg, "dropping undecodable frame");
            }
            Err(fault) => {
                if shared.mark_dead() {
                    tracing::warn!(?fault, "companion connection lost");
                    shared
                        .correlator
                        .cancel_all(ConnectionError::PeerDied.into());
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_resolves_call() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);
        let correlator = Arc::new(RequestCorrelator::default());
        let channel = FramedChannel::start(client_r, client_w, correlator);

        let server = tokio::spawn(async move {
            let frame = read_frame(&mut server_r).await.unwrap().unwrap();
            let Frame::Call { id, request } = frame else {
                panic!("expected call frame");
            };
            assert_eq!(request, Request::GetVersion);
            let reply = Frame::Reply { id, response: Response::Version { version: 3 } };
            server_w.write_all(&encode_frame(&reply).unwrap()).await.unwrap();
            server_w
        });

        let response = channel.call(Request::GetVersion, Duration::from_secs(5)).await;
        assert_eq!(response, Ok(Response::Version { version: 3 }));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_eof_fails_pending_with_peer_died() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let correlator = Arc::new(RequestCorrelator::default());
        let channel = FramedChannel::start(client_r, client_w, Arc::clone(&correlator));

        let (_id, rx) = correlator.register(Duration::from_secs(30)).unwrap();
        drop(server);

        channel.closed().await;
        assert!(!channel.is_alive());
        assert!(matches!(
            rx.await,
            Ok(Err(LinkError::Connection(ConnectionError::PeerDied)))
        ));
    }

    #[tokio::test]
    async fn test_push_is_forwarded() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (_server_r, mut server_w) = tokio::io::split(server);
        let correlator = Arc::new(RequestCorrelator::default());
        let channel = FramedChannel::start(client_r, client_w, correlator);
        let mut pushes = channel.pushes();

        let push = Frame::Push {
            push: Push::BufferReleaseRequest { buffer_id: 5, timeout_ms: 100 },
        };
        server_w.write_all(&encode_frame(&push).unwrap()).await.unwrap();

        assert_eq!(
            pushes.recv().await.ok(),
            Some(Push::BufferReleaseRequest { buffer_id: 5, timeout_ms: 100 })
        );
    }
}
