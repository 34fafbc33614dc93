//! The transport seam (C1): abstracts a raw CAN device down to a blocking
//! receive and a non-blocking send.
//!
//! Grounded in the teacher's `CanSocket` (`read`/`write`, `should_retry`
//! timeout classification in `errors.rs`'s `ShouldRetry`-adjacent pattern),
//! generalized into an `async_trait` so real backends (SocketCAN, SLCAN,
//! PCAN, Vector, virtual — see spec §6) can be supplied by the embedding
//! application without this crate depending on any of them.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{TransportError, TransportState};
use crate::frame::CanFrame;

/// A raw CAN transport. `recv` is the **only** method the [`crate::dispatcher::Dispatcher`]
/// calls in its receive loop; no other component may call it (spec §4.2,
/// §9 "single-receive-source discipline"). `send` may serialize internally
/// but never blocks the caller for longer than a local critical section.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Block up to `timeout` waiting for one frame. A `Timeout` is not an
    /// error condition: the caller (the dispatcher) simply loops again.
    async fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;

    /// Queue a frame for transmission.
    async fn send(&self, frame: CanFrame) -> Result<(), TransportError>;

    /// Current connectivity state.
    async fn state(&self) -> TransportState;

    /// Disconnects the adapter and releases any underlying resources.
    /// Idempotent.
    async fn shutdown(&self);
}

/// An in-process [`Transport`] driven entirely by test/example code: frames
/// are injected with [`MockTransport::inject`] and popped out in FIFO order
/// by `recv`; faults are induced with [`MockTransport::fail`].
///
/// This is the only concrete `Transport` this crate ships — real hardware
/// backends are external collaborators per spec §6. Grounded in the
/// teacher's `ShouldRetry` trait (distinguishing a transient "nothing to
/// read" condition from a real I/O error) and in `zeroclaw`'s
/// `MockCanInterface` (scripted responses for tests).
pub struct MockTransport {
    inner: Mutex<MockInner>,
}

struct MockInner {
    inbound: VecDeque<CanFrame>,
    sent: Vec<CanFrame>,
    state: TransportState,
    fault: Option<TransportError>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            inner: Mutex::new(MockInner {
                inbound: VecDeque::new(),
                sent: Vec::new(),
                state: TransportState::Connected,
                fault: None,
            }),
        }
    }

    /// Queue a frame to be returned by a future `recv` call.
    pub async fn inject(&self, frame: CanFrame) {
        let mut inner = self.inner.lock().await;
        inner.inbound.push_back(frame);
    }

    /// Drain every frame handed to `send` so far, in submission order.
    pub async fn sent_frames(&self) -> Vec<CanFrame> {
        self.inner.lock().await.sent.clone()
    }

    /// Arrange for the *next* `recv`/`send` call to fail with `err`, and
    /// leave the transport in the corresponding disconnected/error state
    /// for calls after that, matching real adapters: once disconnected, an
    /// adapter stays disconnected until reconnected.
    pub async fn fail(&self, err: TransportError) {
        let mut inner = self.inner.lock().await;
        inner.state = match &err {
            TransportError::Disconnected(_) => TransportState::Disconnected,
            _ => TransportState::Error,
        };
        inner.fault = Some(err);
    }

    /// Clear an induced fault and restore the `Connected` state, simulating
    /// a reconnect.
    pub async fn reconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.fault = None;
        inner.state = TransportState::Connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn recv(&self, _timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.fault.clone() {
            return Err(err);
        }
        Ok(inner.inbound.pop_front())
    }

    async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.fault.clone() {
            return Err(err);
        }
        inner.sent.push(frame);
        Ok(())
    }

    async fn state(&self) -> TransportState {
        self.inner.lock().await.state
    }

    async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = TransportState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Direction;

    #[tokio::test]
    async fn recv_returns_none_when_empty() {
        let t = MockTransport::new();
        assert_eq!(t.recv(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_frames_come_out_fifo() {
        let t = MockTransport::new();
        t.inject(CanFrame::new(1, false, vec![], 0, Direction::Rx).unwrap()).await;
        t.inject(CanFrame::new(2, false, vec![], 1, Direction::Rx).unwrap()).await;
        let a = t.recv(Duration::from_millis(10)).await.unwrap().unwrap();
        let b = t.recv(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!((a.id(), b.id()), (1, 2));
    }

    #[tokio::test]
    async fn induced_disconnect_fails_subsequent_calls() {
        let t = MockTransport::new();
        t.fail(TransportError::Disconnected("cable pull".into())).await;
        assert_eq!(t.state().await, TransportState::Disconnected);
        assert!(t.recv(Duration::from_millis(10)).await.is_err());
        assert!(t.send(CanFrame::new(1, false, vec![], 0, Direction::Tx).unwrap()).await.is_err());
    }
}
