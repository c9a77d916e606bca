//! Request/response correlation for asynchronous companion calls.
//!
//! Every outgoing call gets a process-unique id and a one-shot result slot.
//! The connection's reader task resolves slots as replies arrive; a caller
//! whose reply never comes fails with a Timeout after its own deadline, and a
//! background sweep force-cancels anything older than `timeout + grace` in
//! case a deadline was missed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::protocol::{CallId, Response};
use crate::error::{ConnectionError, LinkError, Result};
use crate::observe::EventStream;
use crate::telemetry::metrics;

/// Configuration for the correlator.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Default per-request timeout.
    pub request_timeout: Duration,
    /// Interval between orphan sweeps.
    pub sweep_interval: Duration,
    /// Extra age beyond a call's timeout before the sweep reclaims it.
    pub grace_period: Duration,
    /// Capacity of the timeout event stream.
    pub event_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
            event_capacity: 64,
        }
    }
}

/// Published whenever a call fails by timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTimeout {
    pub id: CallId,
    pub timeout: Duration,
    /// True when reclaimed by the orphan sweep rather than the caller.
    pub swept: bool,
}

type ResultSlot = oneshot::Sender<Result<Response>>;

struct PendingCall {
    slot: ResultSlot,
    created_at: Instant,
    timeout: Duration,
}

/// Maps outstanding call ids to their result slots.
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CallId, PendingCall>>,
    timeouts: EventStream<CallTimeout>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    config: CorrelatorConfig,
}

impl RequestCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            timeouts: EventStream::new(config.event_capacity),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Register a new pending call and return its id and result receiver.
    pub fn register(
        &self,
        timeout: Duration,
    ) -> Result<(CallId, oneshot::Receiver<Result<Response>>)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.lock().insert(
            id,
            PendingCall {
                slot: tx,
                created_at: Instant::now(),
                timeout,
            },
        );
        debug_assert!(previous.is_none(), "call id reused");
        Ok((id, rx))
    }

    /// Issue a call: register, hand the id to `dispatch` (which writes the
    /// request), then wait for resolution. `timeout` bounds dispatch and the
    /// wait together.
    ///
    /// A dispatch failure removes the pending entry and is returned as-is. If
    /// the returned future is dropped before the call settles, the entry is
    /// removed on drop.
    pub async fn issue<T, D, Fut, F>(
        &self,
        timeout: Duration,
        dispatch: D,
        transform: F,
    ) -> Result<T>
    where
        D: FnOnce(CallId) -> Fut,
        Fut: Future<Output = Result<()>>,
        F: FnOnce(Response) -> Result<T>,
    {
        let (id, mut rx) = self.register(timeout)?;
        let mut guard = PendingGuard::new(self, id, timeout);

        let settled = async {
            dispatch(id).await?;
            (&mut rx).await.map_err(|_| LinkError::Closed)?
        };
        let outcome = tokio::time::timeout_at(guard.deadline, settled).await;
        guard.disarm();

        match outcome {
            Ok(Ok(response)) => transform(response),
            Ok(Err(e)) => {
                // Settled calls are already gone; a failed dispatch is not.
                self.pending.lock().remove(&id);
                Err(e)
            }
            Err(_) => {
                if self.pending.lock().remove(&id).is_some() {
                    self.report_timeout(id, timeout, false);
                    return Err(ConnectionError::Timeout(timeout).into());
                }
                // Resolved concurrently with the deadline; the slot is already filled.
                match rx.await {
                    Ok(result) => result.and_then(transform),
                    Err(_) => Err(LinkError::Closed),
                }
            }
        }
    }

    /// Deliver a reply. Returns false when the id is unknown or already
    /// settled, which is not an error.
    pub fn resolve(&self, id: CallId, response: Response) -> bool {
        self.settle(id, Ok(response))
    }

    /// Fail a single call. Idempotent like [`Self::resolve`].
    pub fn cancel(&self, id: CallId, error: LinkError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: CallId, result: Result<Response>) -> bool {
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(call) => {
                // The caller may have gone away; that is fine.
                let _ = call.slot.send(result);
                true
            }
            None => {
                tracing::trace!(call_id = id, "settle for unknown or settled call ignored");
                false
            }
        }
    }

    /// Fail every outstanding call with `error` in one critical section.
    pub fn cancel_all(&self, error: LinkError) -> usize {
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.slot.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!(count, error = %error, "cancelled all pending calls");
        }
        count
    }

    /// Reclaim calls older than their timeout plus the grace period.
    pub fn sweep_orphans(&self) -> usize {
        let grace = self.config.grace_period;
        let orphans: Vec<(CallId, PendingCall)> = {
            let mut pending = self.pending.lock();
            let expired: Vec<CallId> = pending
                .iter()
                .filter(|(_, call)| call.created_at.elapsed() > call.timeout + grace)
                .map(|(id, _)| *id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };

        let count = orphans.len();
        for (id, call) in orphans {
            tracing::warn!(call_id = id, "orphaned call reclaimed by sweep");
            let _ = call
                .slot
                .send(Err(ConnectionError::Timeout(call.timeout).into()));
            self.report_timeout(id, call.timeout, true);
        }
        if count > 0 {
            metrics::record_orphans_swept(count as u64);
        }
        count
    }

    /// Start the periodic orphan sweep. Stops on [`Self::close`].
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        this.sweep_orphans();
                    }
                }
            }
            tracing::debug!("correlator sweep stopped");
        })
    }

    /// Stop the sweep, refuse new calls, and fail all pending ones with
    /// `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        self.cancel_all(LinkError::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Timeout events (bounded, drop-oldest).
    pub fn subscribe_timeouts(&self) -> tokio::sync::broadcast::Receiver<CallTimeout> {
        self.timeouts.subscribe()
    }

    fn report_timeout(&self, id: CallId, timeout: Duration, swept: bool) {
        tracing::warn!(call_id = id, ?timeout, swept, "call timed out");
        metrics::record_call_timed_out();
        self.timeouts.publish(CallTimeout { id, timeout, swept });
    }
}

/// Reclaims a pending entry whose issuing future was dropped mid-call.
struct PendingGuard<'a> {
    correlator: &'a RequestCorrelator,
    id: CallId,
    timeout: Duration,
    deadline: Instant,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(correlator: &'a RequestCorrelator, id: CallId, timeout: Duration) -> Self {
        Self {
            correlator,
            id,
            timeout,
            deadline: Instant::now() + timeout,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.correlator.pending.lock().remove(&self.id).is_none() {
            return;
        }
        if Instant::now() >= self.deadline {
            self.correlator.report_timeout(self.id, self.timeout, false);
        } else {
            tracing::debug!(call_id = self.id, "call abandoned before it settled");
        }
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new(CorrelatorConfig::default())
    }
}
