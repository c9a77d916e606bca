//! Pool of companion-owned shared buffers.
//!
//! Uses parking_lot::Mutex for bookkeeping; the release RPC always happens
//! after the lock is dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{ConnectionError, LinkError, Result};
use crate::ipc::{BufferDescriptor, Request, Response, Transport};
use crate::observe::EventStream;
use crate::telemetry::metrics;

/// Returns a buffer to the companion.
#[async_trait]
pub trait BufferReleaser: Send + Sync {
    async fn release(&self, buffer_id: u64) -> Result<()>;
}

#[async_trait]
impl BufferReleaser for Transport {
    async fn release(&self, buffer_id: u64) -> Result<()> {
        match self.execute(Request::ReleaseScreenshot { buffer_id }).await? {
            Response::Ack => Ok(()),
            other => Err(LinkError::Protocol(format!(
                "unexpected release reply: {other:?}"
            ))),
        }
    }
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Maximum buffers held at once. Never below 2, so a read and a write
    /// buffer can coexist.
    pub max_buffers: usize,
    /// Bound on a flow-control release when the companion gives none.
    pub default_release_timeout: Duration,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_buffers: 3,
            default_release_timeout: Duration::from_secs(2),
        }
    }
}

/// A buffer currently lent to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedBuffer {
    pub id: u64,
    pub handle: u64,
    pub width: u32,
    pub height: u32,
    pub acquired_at: Instant,
}

impl ManagedBuffer {
    fn from_descriptor(desc: BufferDescriptor) -> Self {
        Self {
            id: desc.id,
            handle: desc.handle,
            width: desc.width,
            height: desc.height,
            acquired_at: Instant::now(),
        }
    }
}

/// Why a buffer left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Explicit,
    Evicted,
    FlowControl,
    MemoryPressure,
}

/// Pool events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PressureEvent {
    /// The companion asked for a buffer back.
    ReleaseRequested { buffer_id: u64, timeout_ms: u64 },
    Released { buffer_id: u64, reason: ReleaseReason },
    /// Local bookkeeping dropped after the companion went away.
    Cleared { count: usize },
}

#[derive(Default)]
struct PoolInner {
    /// In acquisition order, oldest first.
    buffers: VecDeque<ManagedBuffer>,
    write: Option<u64>,
    read: Option<u64>,
}

impl PoolInner {
    fn remove(&mut self, id: u64) -> Option<ManagedBuffer> {
        let pos = self.buffers.iter().position(|b| b.id == id)?;
        if self.write == Some(id) {
            self.write = None;
        }
        if self.read == Some(id) {
            self.read = None;
        }
        self.buffers.remove(pos)
    }
}

/// Fixed-capacity pool with write/read double buffering.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    releaser: Arc<dyn BufferReleaser>,
    events: EventStream<PressureEvent>,
    config: BufferPoolConfig,
}

impl BufferPool {
    pub fn new(releaser: Arc<dyn BufferReleaser>, mut config: BufferPoolConfig) -> Self {
        config.max_buffers = config.max_buffers.max(2);
        Self {
            inner: Mutex::new(PoolInner::default()),
            releaser,
            events: EventStream::default(),
            config,
        }
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// Take ownership of a buffer handed out by the companion.
    ///
    /// At capacity, the oldest buffer that is not the current write buffer is
    /// evicted and returned to the companion. The new buffer becomes the
    /// write buffer and the previous write buffer becomes the read buffer.
    pub async fn acquire_buffer(&self, desc: BufferDescriptor) -> ManagedBuffer {
        let buffer = ManagedBuffer::from_descriptor(desc);
        let evicted = {
            let mut inner = self.inner.lock();
            // A re-sent descriptor replaces the stale entry.
            inner.remove(buffer.id);

            let mut evicted = None;
            if inner.buffers.len() >= self.config.max_buffers {
                let write = inner.write;
                if let Some(pos) = inner.buffers.iter().position(|b| Some(b.id) != write) {
                    let victim = inner.buffers[pos].id;
                    evicted = inner.remove(victim);
                }
            }

            inner.buffers.push_back(buffer.clone());
            inner.read = inner.write.replace(buffer.id);
            evicted
        };

        if let Some(victim) = evicted {
            tracing::debug!(buffer_id = victim.id, "evicting oldest buffer");
            metrics::record_buffer_evicted();
            self.return_to_companion(victim.id, ReleaseReason::Evicted, None).await;
        }
        buffer
    }

    /// Return a buffer to the companion. Returns false if it was not held.
    pub async fn release_buffer(&self, buffer_id: u64) -> Result<bool> {
        let removed = self.inner.lock().remove(buffer_id);
        if removed.is_none() {
            return Ok(false);
        }
        self.releaser.release(buffer_id).await?;
        self.events.publish(PressureEvent::Released {
            buffer_id,
            reason: ReleaseReason::Explicit,
        });
        Ok(true)
    }

    /// Flow-control request from the companion: release `buffer_id` no matter
    /// how full the pool is, bounded by `timeout_ms`. Ids the pool does not
    /// hold are ignored.
    pub async fn handle_memory_pressure(&self, buffer_id: u64, timeout_ms: u64) {
        self.events
            .publish(PressureEvent::ReleaseRequested { buffer_id, timeout_ms });
        let removed = self.inner.lock().remove(buffer_id);
        if removed.is_none() {
            tracing::debug!(buffer_id, "release requested for buffer not held");
            return;
        }
        let bound = if timeout_ms == 0 {
            self.config.default_release_timeout
        } else {
            Duration::from_millis(timeout_ms)
        };
        self.return_to_companion(buffer_id, ReleaseReason::FlowControl, Some(bound))
            .await;
    }

    /// Release everything except the current write buffer.
    pub async fn release_non_essential(&self) -> usize {
        let released: Vec<ManagedBuffer> = {
            let mut inner = self.inner.lock();
            let write = inner.write;
            let ids: Vec<u64> = inner
                .buffers
                .iter()
                .filter(|b| Some(b.id) != write)
                .map(|b| b.id)
                .collect();
            ids.into_iter().filter_map(|id| inner.remove(id)).collect()
        };
        let count = released.len();
        for buffer in released {
            self.return_to_companion(buffer.id, ReleaseReason::MemoryPressure, None)
                .await;
        }
        if count > 0 {
            tracing::info!(count, "released non-essential buffers");
        }
        count
    }

    /// Forget every buffer without contacting the companion.
    pub fn clear_local(&self) -> usize {
        let count = {
            let mut inner = self.inner.lock();
            let count = inner.buffers.len();
            *inner = PoolInner::default();
            count
        };
        if count > 0 {
            tracing::debug!(count, "buffer pool cleared locally");
            self.events.publish(PressureEvent::Cleared { count });
        }
        count
    }

    async fn return_to_companion(
        &self,
        buffer_id: u64,
        reason: ReleaseReason,
        bound: Option<Duration>,
    ) {
        let result = match bound {
            Some(bound) => {
                match tokio::time::timeout(bound, self.releaser.release(buffer_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::Timeout(bound).into()),
                }
            }
            None => self.releaser.release(buffer_id).await,
        };
        if let Err(e) = result {
            tracing::warn!(buffer_id, ?reason, error = %e, "buffer release failed");
        }
        self.events.publish(PressureEvent::Released { buffer_id, reason });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffers.is_empty()
    }

    pub fn write_buffer(&self) -> Option<u64> {
        self.inner.lock().write
    }

    pub fn read_buffer(&self) -> Option<u64> {
        self.inner.lock().read
    }

    pub fn get(&self, buffer_id: u64) -> Option<ManagedBuffer> {
        self.inner
            .lock()
            .buffers
            .iter()
            .find(|b| b.id == buffer_id)
            .cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PressureEvent> {
        self.events.subscribe()
    }
}
