//! The dispatcher (C2): owns the single receive task, fans frames out to a
//! broadcast channel for observers, and forwards frames matching a
//! registered `rx_id` into that endpoint's bounded inbox.
//!
//! Spec §4.2's critical invariant — **no component other than the
//! dispatcher may call `Transport::recv`** — is enforced by construction:
//! the transport is moved into the `Dispatcher` and never handed back out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::frame::{CanFrame, FrameRingBuffer};
use crate::transport::Transport;

/// Default per-endpoint inbox capacity (spec §5, back-pressure).
pub const DEFAULT_INBOX_CAPACITY: usize = 64;
/// Default blocking receive timeout the dispatcher hands to the transport
/// (spec §4.2, tunable per transport per spec §9 open questions).
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// Default broadcast channel depth for observers.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 4096;

/// Opaque handle returned by [`Dispatcher::register`]; pass back to
/// [`Dispatcher::unregister`] to tear the endpoint down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointHandle {
    pub(crate) rx_id: u32,
    pub(crate) tx_id: u32,
}

impl EndpointHandle {
    pub fn rx_id(&self) -> u32 {
        self.rx_id
    }

    pub fn tx_id(&self) -> u32 {
        self.tx_id
    }
}

/// Tunable knobs for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub receive_timeout: Duration,
    pub ring_capacity: usize,
    pub inbox_capacity: usize,
    pub broadcast_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            receive_timeout: DEFAULT_RECV_TIMEOUT,
            ring_capacity: crate::frame::DEFAULT_RING_CAPACITY,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// Counters a careful caller (or a test asserting spec §8's ≥95%
/// throughput property) can sample without scraping logs.
///
/// Observer drop counts aren't tracked here: `tokio::sync::broadcast` only
/// reports a lagging subscriber to that subscriber itself (`RecvError::
/// Lagged` on its own `recv()`), never back to the sender, so a dispatcher-
/// side counter could never be correct. A caller that needs that number
/// counts `Lagged(n)` on its own subscription.
#[derive(Default)]
pub struct DispatcherStats {
    pub frames_received: AtomicU64,
}

/// A bounded, oldest-drops-first inbox for one ISO-TP endpoint. A plain
/// `mpsc::Receiver` can't express "drop the oldest entry on overflow", so
/// this is a small hand-rolled async queue: a mutex-guarded deque plus a
/// `Notify` to wake a waiting reader.
pub(crate) struct Inbox {
    capacity: usize,
    queue: Mutex<VecDeque<CanFrame>>,
    notify: Notify,
    overruns: AtomicU64,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        Inbox {
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            overruns: AtomicU64::new(0),
        }
    }

    async fn push(&self, frame: CanFrame) {
        let mut q = self.queue.lock().await;
        if q.len() == self.capacity {
            q.pop_front();
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(frame);
        drop(q);
        self.notify.notify_one();
    }

    pub(crate) async fn recv(&self) -> CanFrame {
        loop {
            {
                let mut q = self.queue.lock().await;
                if let Some(frame) = q.pop_front() {
                    return frame;
                }
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn overrun_count(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

struct Endpoints {
    by_rx_id: HashMap<u32, Arc<Inbox>>,
}

/// Owns the single receive task and the `rx_id -> endpoint inbox` map.
pub struct Dispatcher {
    transport: Box<dyn Transport>,
    config: DispatcherConfig,
    ring: Mutex<FrameRingBuffer>,
    broadcast_tx: broadcast::Sender<CanFrame>,
    endpoints: RwLock<Endpoints>,
    pub stats: DispatcherStats,
    cancel: CancellationToken,
    /// Carries the fatal transport error (if any) that ended the receive
    /// loop, so registered endpoints can surface `TransportError::
    /// Disconnected` promptly instead of waiting out their own ISO-TP
    /// timers (spec §7: in-flight requests fail with this code).
    disconnect_tx: watch::Sender<Option<TransportError>>,
}

impl Dispatcher {
    pub fn new(transport: Box<dyn Transport>, config: DispatcherConfig, cancel: CancellationToken) -> Self {
        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity);
        let (disconnect_tx, _) = watch::channel(None);
        Dispatcher {
            ring: Mutex::new(FrameRingBuffer::new(config.ring_capacity)),
            broadcast_tx,
            endpoints: RwLock::new(Endpoints { by_rx_id: HashMap::new() }),
            stats: DispatcherStats::default(),
            transport,
            config,
            cancel,
            disconnect_tx,
        }
    }

    /// Subscribe to the transport-disconnect signal. Resolves (carrying the
    /// triggering error) once the receive loop observes a fatal, non-timeout
    /// transport error. Used by [`crate::isotp::IsoTpEndpoint`] so a
    /// blocked `send_pdu`/`recv_pdu` fails immediately rather than timing
    /// out.
    pub fn disconnect_signal(&self) -> watch::Receiver<Option<TransportError>> {
        self.disconnect_tx.subscribe()
    }

    /// Subscribe to the live frame broadcast. Never blocks the dispatcher:
    /// a slow subscriber misses frames (detected as `Lagged`) instead of
    /// stalling the receive loop.
    pub fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.broadcast_tx.subscribe()
    }

    /// Snapshot of the last `n` frames from the ring buffer, oldest first.
    pub async fn recent_frames(&self) -> Vec<CanFrame> {
        self.ring.lock().await.iter().cloned().collect()
    }

    /// Register an ISO-TP endpoint's `rx_id`. Fails if `rx_id` is already
    /// bound (spec §3: the `rx_id -> endpoint` mapping must be injective).
    pub async fn register(&self, rx_id: u32, tx_id: u32) -> Result<(EndpointHandle, Arc<dyn EndpointInbox>), crate::error::CoreError> {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.by_rx_id.contains_key(&rx_id) {
            return Err(crate::error::CoreError::DuplicateRxId(rx_id));
        }
        let inbox = Arc::new(Inbox::new(self.config.inbox_capacity));
        endpoints.by_rx_id.insert(rx_id, inbox.clone());
        Ok((EndpointHandle { rx_id, tx_id }, inbox as Arc<dyn EndpointInbox>))
    }

    pub async fn unregister(&self, handle: EndpointHandle) {
        let mut endpoints = self.endpoints.write().await;
        endpoints.by_rx_id.remove(&handle.rx_id);
    }

    /// Total ISO-TP inbox overruns across every currently-registered
    /// endpoint.
    pub async fn isotp_overrun_count(&self) -> u64 {
        let endpoints = self.endpoints.read().await;
        endpoints.by_rx_id.values().map(|i| i.overrun_count()).sum()
    }

    /// Send a frame out through the transport. Used by the UDS client, the
    /// ISO-TP endpoints, and the transmit scheduler — all of which share
    /// this single entry point rather than touching the transport
    /// directly.
    pub async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        self.transport.send(frame).await
    }

    pub async fn transport_state(&self) -> crate::error::TransportState {
        self.transport.state().await
    }

    /// Runs the receive loop until cancelled or the transport reports a
    /// fatal (non-timeout) error. Spec §4.2: exactly one task ever calls
    /// this.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::debug!("dispatcher cancelled, shutting down receive loop");
                    break;
                }
                res = self.transport.recv(self.config.receive_timeout) => {
                    match res {
                        Ok(Some(frame)) => self.handle_frame(frame).await,
                        Ok(None) => continue,
                        Err(TransportError::Timeout) => continue,
                        Err(e) => {
                            log::warn!("transport error in receive loop: {e}");
                            let _ = self.disconnect_tx.send(Some(e));
                            break;
                        }
                    }
                }
            }
        }
        self.transport.shutdown().await;
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn handle_frame(&self, frame: CanFrame) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        self.ring.lock().await.push(frame.clone());

        if self.broadcast_tx.send(frame.clone()).is_err() {
            // No subscribers at all right now; not a drop, just nobody home.
        }

        let endpoints = self.endpoints.read().await;
        if let Some(inbox) = endpoints.by_rx_id.get(&frame.id()) {
            inbox.push(frame).await;
        }
    }
}

/// Narrow trait so [`crate::isotp::IsoTpEndpoint`] can hold an inbox handle
/// without depending on the dispatcher's internal `Inbox` type directly.
#[async_trait::async_trait]
pub trait EndpointInbox: Send + Sync {
    async fn recv(&self) -> CanFrame;
}

#[async_trait::async_trait]
impl EndpointInbox for Inbox {
    async fn recv(&self) -> CanFrame {
        Inbox::recv(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Direction;
    use crate::transport::MockTransport;

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, false, vec![1, 2, 3], 0, Direction::Rx).unwrap()
    }

    #[tokio::test]
    async fn forwards_matching_frames_to_registered_inbox() {
        let transport = MockTransport::new();
        transport.inject(frame(0x7e8)).await;
        transport.inject(frame(0x123)).await; // unmatched, observer-only

        let dispatcher = Arc::new(Dispatcher::new(
            Box::new(transport),
            DispatcherConfig::default(),
            CancellationToken::new(),
        ));
        let (_handle, inbox) = dispatcher.register(0x7e8, 0x7e0).await.unwrap();

        let mut sub = dispatcher.subscribe();
        let d = dispatcher.clone();
        let run = tokio::spawn(async move { d.run().await });

        let matched = tokio::time::timeout(Duration::from_secs(1), inbox.recv()).await.unwrap();
        assert_eq!(matched.id(), 0x7e8);

        // Both frames went out on the broadcast channel too.
        let first = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!((first.id(), second.id()), (0x7e8, 0x123));

        dispatcher.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_rx_id_registration_fails() {
        let dispatcher = Dispatcher::new(
            Box::new(MockTransport::new()),
            DispatcherConfig::default(),
            CancellationToken::new(),
        );
        dispatcher.register(0x7e8, 0x7e0).await.unwrap();
        let err = dispatcher.register(0x7e8, 0x7e1).await.unwrap_err();
        assert_eq!(err, crate::error::CoreError::DuplicateRxId(0x7e8));
    }

    #[tokio::test]
    async fn inbox_overflow_drops_oldest_and_counts_overrun() {
        let inbox = Inbox::new(2);
        inbox.push(frame(1)).await;
        inbox.push(frame(2)).await;
        inbox.push(frame(3)).await;
        assert_eq!(inbox.overrun_count(), 1);
        assert_eq!(inbox.recv().await.id(), 2);
        assert_eq!(inbox.recv().await.id(), 3);
    }
}
