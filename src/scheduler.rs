//! The transmit scheduler (C6): single-shot, burst, and periodic CAN
//! transmissions, driven by one timer task over a min-heap of deadlines.
//!
//! Grounded in the teacher's single-writer-queue discipline (the
//! dispatcher owns the only receive path; here, the scheduler owns the
//! only "what do we send next and when" decision) and in the corpus's use
//! of `tokio::time::sleep_until` for timer-driven loops.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::SchedulerError;
use crate::frame::CanFrame;

/// Opaque handle to a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

#[derive(Default)]
struct JobIdSource(AtomicU64);

impl JobIdSource {
    fn next(&self) -> JobId {
        JobId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// How many more times (if bounded) a periodic job should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Remaining {
    Infinite,
    Count(u32),
}

struct Job {
    id: JobId,
    frame: CanFrame,
    period: Duration,
    remaining: Remaining,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

/// A min-heap entry: ordered by deadline, tie-broken by insertion sequence
/// so equal deadlines still resolve deterministically (spec §4.6).
struct Entry {
    deadline: Instant,
    sequence: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.sequence).cmp(&(other.deadline, other.sequence))
    }
}

struct Heap {
    entries: BinaryHeap<Reverse<Entry>>,
    sequence: u64,
}

/// Schedules single-shot, burst, and periodic CAN transmissions.
///
/// Contract (spec §4.6): periodic jobs continue across transient send
/// errors (logged, not fatal); they stop on explicit cancel, `count`
/// exhaustion, or transport disconnect. Cancellation is idempotent and
/// takes effect before the next frame is emitted.
pub struct TransmitScheduler {
    dispatcher: Arc<Dispatcher>,
    heap: Mutex<Heap>,
    job_ids: JobIdSource,
    cancel: CancellationToken,
    /// Wakes the timer loop when a new deadline might be earlier than the
    /// one it's currently sleeping on (or when it's parked on an empty
    /// heap): `send_periodic` and `cancel` both notify after touching the
    /// heap, so a job added while idle isn't stuck until `shutdown`.
    wake: Notify,
}

impl TransmitScheduler {
    pub fn spawn(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> Arc<Self> {
        let scheduler = Arc::new(TransmitScheduler {
            dispatcher,
            heap: Mutex::new(Heap { entries: BinaryHeap::new(), sequence: 0 }),
            job_ids: JobIdSource::default(),
            cancel,
            wake: Notify::new(),
        });
        let runner = scheduler.clone();
        tokio::spawn(async move { runner.run().await });
        scheduler
    }

    /// Send `frame` once, immediately.
    pub async fn send_once(&self, frame: CanFrame) -> Result<(), crate::error::TransportError> {
        self.dispatcher.send(frame).await
    }

    /// Send `frame` `count` times with `gap` between each. Errors are
    /// logged and the burst continues (matching periodic semantics); the
    /// last error, if any, is returned to the caller once the burst ends.
    pub async fn send_burst(&self, frame: CanFrame, count: u32, gap: Duration) -> Result<(), crate::error::TransportError> {
        let mut last_err = None;
        for i in 0..count {
            if i > 0 {
                tokio::time::sleep(gap).await;
            }
            if let Err(e) = self.dispatcher.send(frame.clone()).await {
                log::warn!("scheduler: burst send failed: {e}");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Schedule `frame` to repeat every `period` (minimum 1ms), optionally
    /// bounded to `count` total transmissions. Returns a [`JobId`] usable
    /// with [`TransmitScheduler::cancel`].
    pub async fn send_periodic(&self, frame: CanFrame, period: Duration, count: Option<u32>) -> Result<JobId, SchedulerError> {
        if period < Duration::from_millis(1) {
            return Err(SchedulerError::InvalidPeriod(period.as_millis() as u64));
        }
        let id = self.job_ids.next();
        let job = Job {
            id,
            frame,
            period,
            remaining: count.map(Remaining::Count).unwrap_or(Remaining::Infinite),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        let mut heap = self.heap.lock().await;
        let sequence = heap.sequence;
        heap.sequence += 1;
        heap.entries.push(Reverse(Entry { deadline: Instant::now() + period, sequence, job }));
        drop(heap);
        self.wake.notify_one();
        Ok(id)
    }

    /// Cancel a periodic job. Idempotent: cancelling an already-cancelled
    /// or already-finished job is not an error.
    pub async fn cancel(&self, id: JobId) {
        let heap = self.heap.lock().await;
        for Reverse(entry) in heap.entries.iter() {
            if entry.job.id == id {
                entry.job.cancelled.store(true, Ordering::Relaxed);
                drop(heap);
                self.wake.notify_one();
                return;
            }
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next_deadline = {
                let heap = self.heap.lock().await;
                heap.entries.peek().map(|Reverse(e)| e.deadline)
            };

            let sleep = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => continue,
                _ = sleep => {}
            }

            if self.cancel.is_cancelled() {
                break;
            }

            let Some(Reverse(entry)) = ({
                let mut heap = self.heap.lock().await;
                if matches!(heap.entries.peek(), Some(Reverse(e)) if e.deadline <= Instant::now()) {
                    heap.entries.pop()
                } else {
                    None
                }
            }) else {
                continue;
            };

            let mut job = entry.job;
            if job.cancelled.load(Ordering::Relaxed) {
                continue;
            }

            if self.dispatcher.transport_state().await != crate::error::TransportState::Connected {
                log::debug!("scheduler: dropping periodic job {:?}, transport disconnected", job.id);
                continue;
            }

            if let Err(e) = self.dispatcher.send(job.frame.clone()).await {
                log::warn!("scheduler: periodic send failed for job {:?}: {e}", job.id);
            }

            let done = match &mut job.remaining {
                Remaining::Infinite => false,
                Remaining::Count(n) => {
                    *n -= 1;
                    *n == 0
                }
            };
            if done || job.cancelled.load(Ordering::Relaxed) {
                continue;
            }

            let mut heap = self.heap.lock().await;
            let sequence = heap.sequence;
            heap.sequence += 1;
            heap.entries.push(Reverse(Entry { deadline: Instant::now() + job.period, sequence, job }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::frame::Direction;
    use crate::transport::MockTransport;

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, false, vec![0xAA], 0, Direction::Tx).unwrap()
    }

    // A thin `Transport` delegating to a shared `MockTransport`, so tests
    // can keep a handle to inspect `sent_frames()` after the dispatcher has
    // taken ownership of the transport.
    struct SharedTransport(Arc<MockTransport>);

    #[async_trait::async_trait]
    impl crate::transport::Transport for SharedTransport {
        async fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, crate::error::TransportError> {
            self.0.recv(timeout).await
        }
        async fn send(&self, frame: CanFrame) -> Result<(), crate::error::TransportError> {
            self.0.send(frame).await
        }
        async fn state(&self) -> crate::error::TransportState {
            self.0.state().await
        }
        async fn shutdown(&self) {
            self.0.shutdown().await
        }
    }

    fn dispatcher_over(transport: Arc<MockTransport>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(Box::new(SharedTransport(transport)), DispatcherConfig::default(), CancellationToken::new()))
    }

    #[tokio::test]
    async fn zero_period_is_rejected() {
        let dispatcher = dispatcher_over(Arc::new(MockTransport::new()));
        let scheduler = TransmitScheduler::spawn(dispatcher, CancellationToken::new());
        let err = scheduler.send_periodic(frame(0x100), Duration::from_millis(0), None).await.unwrap_err();
        assert_eq!(err, SchedulerError::InvalidPeriod(0));
    }

    #[tokio::test]
    async fn periodic_job_fires_requested_count_then_stops() {
        let transport = Arc::new(MockTransport::new());
        let dispatcher = dispatcher_over(transport.clone());
        let cancel = CancellationToken::new();
        let scheduler = TransmitScheduler::spawn(dispatcher, cancel.clone());

        scheduler.send_periodic(frame(0x200), Duration::from_millis(10), Some(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let sent = transport.sent_frames().await;
        assert_eq!(sent.len(), 3);

        cancel.cancel();
    }

    #[tokio::test]
    async fn cancelling_a_job_stops_future_sends() {
        let transport = Arc::new(MockTransport::new());
        let dispatcher = dispatcher_over(transport.clone());
        let cancel = CancellationToken::new();
        let scheduler = TransmitScheduler::spawn(dispatcher, cancel.clone());

        let id = scheduler.send_periodic(frame(0x300), Duration::from_millis(10), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        scheduler.cancel(id).await;
        let count_at_cancel = transport.sent_frames().await.len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent_frames().await.len(), count_at_cancel);

        cancel.cancel();
    }
}
