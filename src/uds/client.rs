//! The UDS client (C4): request serialization, response classification,
//! session/security state, and the tester-present keepalive.
//!
//! Grounded in the teacher's single-owner resource discipline (one
//! critical section around the transport) generalized to "one outstanding
//! request per endpoint": requests are queued through a bounded channel
//! drained by a single worker task, so submission order is preserved and a
//! full queue is rejected synchronously rather than blocking the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::UdsError;
use crate::isotp::IsoTpEndpoint;
use crate::security::{Algorithm, SecurityEngine};

use super::types::{
    CorrelationId, CorrelationIdSource, Nrc, UdsRequest, UdsResponse, UdsSession, DEFAULT_P2,
    DEFAULT_P2_EXT, DEFAULT_SESSION, DEFAULT_TESTER_PRESENT_PERIOD, TESTER_PRESENT_FAILURE_LIMIT,
};

/// Default depth of the outbound request queue (spec §5 back-pressure).
pub const DEFAULT_REQUEST_QUEUE_CAPACITY: usize = 32;
/// How long to wait for an (unexpected) negative response to a
/// suppress-positive-response request before declaring it successful.
const SUPPRESSED_RESPONSE_WINDOW: Duration = Duration::from_millis(200);

/// Tunables for a [`UdsClient`].
#[derive(Debug, Clone)]
pub struct UdsClientConfig {
    pub default_timeout: Duration,
    pub default_p2_ext: Duration,
    pub tester_present_period: Duration,
    pub request_queue_capacity: usize,
}

impl Default for UdsClientConfig {
    fn default() -> Self {
        UdsClientConfig {
            default_timeout: DEFAULT_P2,
            default_p2_ext: DEFAULT_P2_EXT,
            tester_present_period: DEFAULT_TESTER_PRESENT_PERIOD,
            request_queue_capacity: DEFAULT_REQUEST_QUEUE_CAPACITY,
        }
    }
}

enum ClassifyOutcome {
    Positive(Vec<u8>),
    Pending,
    Negative(Nrc),
    Violation,
}

/// Classify a reassembled response PDU against the request's service id
/// (spec §4.4).
fn classify_response(service_id: u8, pdu: &[u8]) -> ClassifyOutcome {
    let Some(&first) = pdu.first() else {
        return ClassifyOutcome::Violation;
    };
    if first == service_id.wrapping_add(0x40) {
        return ClassifyOutcome::Positive(pdu[1..].to_vec());
    }
    if first == 0x7F {
        if pdu.len() < 3 || pdu[1] != service_id {
            return ClassifyOutcome::Violation;
        }
        let nrc = Nrc(pdu[2]);
        return if nrc.is_response_pending() { ClassifyOutcome::Pending } else { ClassifyOutcome::Negative(nrc) };
    }
    ClassifyOutcome::Violation
}

struct QueuedRequest {
    request: UdsRequest,
    respond: oneshot::Sender<Result<Vec<u8>, UdsError>>,
}

/// A running UDS client bound to one ISO-TP endpoint.
pub struct UdsClient {
    endpoint: Arc<IsoTpEndpoint>,
    session: Mutex<UdsSession>,
    correlation_ids: CorrelationIdSource,
    queue_tx: mpsc::Sender<QueuedRequest>,
    response_tx: broadcast::Sender<(CorrelationId, Result<UdsResponse, UdsError>)>,
    cancel: CancellationToken,
    default_timeout: Duration,
    default_p2_ext: Duration,
    tester_present_period: Duration,
}

impl UdsClient {
    /// Spawn the request worker and the tester-present keepalive, and
    /// return a handle to the running client.
    pub fn spawn(endpoint: Arc<IsoTpEndpoint>, config: UdsClientConfig, cancel: CancellationToken) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.request_queue_capacity.max(1));
        let (response_tx, _) = broadcast::channel(64);

        let client = Arc::new(UdsClient {
            endpoint,
            session: Mutex::new(UdsSession::new()),
            correlation_ids: CorrelationIdSource::default(),
            queue_tx,
            response_tx,
            cancel,
            default_timeout: config.default_timeout,
            default_p2_ext: config.default_p2_ext,
            tester_present_period: config.tester_present_period,
        });

        let worker = client.clone();
        tokio::spawn(async move { worker.run_queue(queue_rx).await });

        let keepalive = client.clone();
        tokio::spawn(async move { keepalive.tester_present_loop().await });

        client
    }

    pub async fn session(&self) -> UdsSession {
        self.session.lock().await.clone()
    }

    /// Subscribe to classified [`UdsResponse`]s keyed by correlation id
    /// (spec §6 observer interface). A protocol-level reply (positive or
    /// negative) arrives as `Ok`; anything that never became a reply at
    /// all (timeout, protocol violation, cancellation, a transport/security
    /// failure) arrives as `Err`.
    pub fn subscribe_responses(&self) -> broadcast::Receiver<(CorrelationId, Result<UdsResponse, UdsError>)> {
        self.response_tx.subscribe()
    }

    /// Submit a request with the client's default timeouts. The positive
    /// response payload (service byte stripped) is returned on success; a
    /// negative response surfaces as [`UdsError::Negative`].
    pub async fn request(&self, service_id: u8, sub_function: Option<u8>, payload: Vec<u8>) -> Result<Vec<u8>, UdsError> {
        self.request_with_timeout(service_id, sub_function, payload, self.default_timeout, self.default_p2_ext).await
    }

    pub async fn request_with_timeout(
        &self,
        service_id: u8,
        sub_function: Option<u8>,
        payload: Vec<u8>,
        timeout: Duration,
        p2_ext: Duration,
    ) -> Result<Vec<u8>, UdsError> {
        let correlation_id = self.correlation_ids.next();
        let request = UdsRequest { service_id, sub_function, payload, timeout, p2_ext, correlation_id };
        let (respond, reply) = oneshot::channel();

        self.queue_tx.try_send(QueuedRequest { request, respond }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => UdsError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => UdsError::Cancelled,
        })?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(UdsError::Cancelled),
            res = reply => res.unwrap_or(Err(UdsError::Cancelled)),
        }
    }

    /// Session control (service 0x10): on success, updates local session
    /// state and starts/stops the tester-present keepalive.
    pub async fn session_control(&self, session_type: u8) -> Result<Vec<u8>, UdsError> {
        let payload = self.request(0x10, Some(session_type), Vec::new()).await?;
        let mut session = self.session.lock().await;
        session.enter_session(session_type);
        if session_type != DEFAULT_SESSION {
            session.tester_present_enabled = true;
        }
        Ok(payload)
    }

    /// Security access (service 0x27): seed/key handshake. `level` is the
    /// odd "request seed" sub-function; the paired key sub-function
    /// (`level + 1`) is derived automatically.
    pub async fn security_access(&self, level: u8, algorithm: &Algorithm) -> Result<(), UdsError> {
        let seed = self.request(0x27, Some(level), Vec::new()).await?;
        if SecurityEngine::seed_means_already_unlocked(&seed) {
            let mut session = self.session.lock().await;
            session.security_level = level;
            session.touch();
            return Ok(());
        }
        let key = SecurityEngine::compute_key(algorithm, level, &seed).await?;
        self.request(0x27, Some(level + 1), key).await?;
        let mut session = self.session.lock().await;
        session.security_level = level;
        session.touch();
        Ok(())
    }

    /// Read Data By Identifier (service 0x22).
    pub async fn read_did(&self, did: u16) -> Result<Vec<u8>, UdsError> {
        self.request(0x22, None, did.to_be_bytes().to_vec()).await
    }

    /// Write Data By Identifier (service 0x2E).
    pub async fn write_did(&self, did: u16, data: &[u8]) -> Result<Vec<u8>, UdsError> {
        let mut payload = did.to_be_bytes().to_vec();
        payload.extend_from_slice(data);
        self.request(0x2E, None, payload).await
    }

    /// Read DTC Information (service 0x19).
    pub async fn read_dtc_information(&self, sub_function: u8, payload: &[u8]) -> Result<Vec<u8>, UdsError> {
        self.request(0x19, Some(sub_function), payload.to_vec()).await
    }

    /// Routine Control (service 0x31).
    pub async fn routine_control(&self, sub_function: u8, routine_id: u16, payload: &[u8]) -> Result<Vec<u8>, UdsError> {
        let mut body = routine_id.to_be_bytes().to_vec();
        body.extend_from_slice(payload);
        self.request(0x31, Some(sub_function), body).await
    }

    /// ECU Reset (service 0x11). Supplemented beyond the wrappers named in
    /// spec §4.4: a diagnostics client is not much of one without it, and it
    /// reuses the request/response path verbatim.
    pub async fn ecu_reset(&self, reset_type: u8) -> Result<Vec<u8>, UdsError> {
        self.request(0x11, Some(reset_type), Vec::new()).await
    }

    /// Clear Diagnostic Information (service 0x14), `group` being the
    /// 3-byte groupOfDTC mask.
    pub async fn clear_diagnostic_information(&self, group: [u8; 3]) -> Result<Vec<u8>, UdsError> {
        self.request(0x14, None, group.to_vec()).await
    }

    async fn run_queue(self: Arc<Self>, mut rx: mpsc::Receiver<QueuedRequest>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = rx.recv() => {
                    let Some(item) = item else { break };
                    let classified = self.execute(&item.request).await;
                    let _ = self.response_tx.send((item.request.correlation_id, classified.clone()));
                    let outcome = match classified {
                        Ok(UdsResponse::Positive { payload, .. }) => Ok(payload),
                        Ok(UdsResponse::Negative { nrc, .. }) => Err(UdsError::Negative(nrc)),
                        Err(e) => Err(e),
                    };
                    let _ = item.respond.send(outcome);
                }
            }
        }
    }

    /// Drive one request to a classified [`UdsResponse`] (or a client-side
    /// [`UdsError`] if it never became one: timeout, protocol violation,
    /// cancellation, or a transport/security failure underneath).
    async fn execute(&self, req: &UdsRequest) -> Result<UdsResponse, UdsError> {
        self.endpoint.send_pdu(&req.bytes()).await?;
        self.session.lock().await.touch();

        // ISO 14229's suppress-positive-response bit: the peer won't answer
        // at all on success, so a timeout here means success, not failure.
        let suppress = req.sub_function.is_some_and(|s| s & 0x80 != 0);
        let mut timeout = if suppress { SUPPRESSED_RESPONSE_WINDOW } else { req.timeout };

        loop {
            match tokio::time::timeout(timeout, self.endpoint.recv_pdu()).await {
                Ok(Ok(pdu)) => match classify_response(req.service_id, &pdu) {
                    ClassifyOutcome::Positive(mut payload) => {
                        self.session.lock().await.touch();
                        // Services submitted with a sub-function echo it as
                        // the first byte of the positive response; strip it
                        // so callers see only the actual payload.
                        if req.sub_function.is_some() && !payload.is_empty() {
                            payload.remove(0);
                        }
                        return Ok(UdsResponse::Positive { service_id: req.service_id.wrapping_add(0x40), payload });
                    }
                    ClassifyOutcome::Pending => {
                        timeout = req.p2_ext;
                        continue;
                    }
                    ClassifyOutcome::Negative(nrc) => return Ok(UdsResponse::Negative { service_id: req.service_id, nrc }),
                    ClassifyOutcome::Violation => return Err(UdsError::ProtocolViolation),
                },
                Ok(Err(e)) => return Err(UdsError::from(e)),
                Err(_) if suppress => return Ok(UdsResponse::Positive { service_id: req.service_id.wrapping_add(0x40), payload: Vec::new() }),
                Err(_) => return Err(UdsError::Timeout),
            }
        }
    }

    async fn tester_present_loop(self: Arc<Self>) {
        let mut consecutive_failures: u8 = 0;
        loop {
            let wake_at = {
                let session = self.session.lock().await;
                tokio::time::Instant::from_std(session.last_activity_monotonic) + self.tester_present_period
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(wake_at) => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.session.lock().await.tester_present_enabled {
                continue;
            }
            match self.request(0x3E, Some(0x80), Vec::new()).await {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    log::warn!("tester present failed ({consecutive_failures}/{TESTER_PRESENT_FAILURE_LIMIT}): {e}");
                    if consecutive_failures >= TESTER_PRESENT_FAILURE_LIMIT {
                        log::warn!("tester present exceeded failure limit, demoting to default session");
                        self.session.lock().await.enter_session(DEFAULT_SESSION);
                        consecutive_failures = 0;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, DispatcherConfig, EndpointHandle};
    use crate::frame::CanFrame;
    use crate::isotp::EndpointConfig;
    use crate::transport::MockTransport;

    #[test]
    fn classify_response_covers_all_outcomes() {
        match classify_response(0x22, &[0x62, 0xF1, 0x90]) {
            ClassifyOutcome::Positive(p) => assert_eq!(p, vec![0xF1, 0x90]),
            _ => panic!("expected positive"),
        }
        assert!(matches!(classify_response(0x31, &[0x7F, 0x31, 0x78]), ClassifyOutcome::Pending));
        match classify_response(0x27, &[0x7F, 0x27, 0x35]) {
            ClassifyOutcome::Negative(nrc) => assert_eq!(nrc, Nrc::INVALID_KEY),
            _ => panic!("expected negative"),
        }
        assert!(matches!(classify_response(0x22, &[]), ClassifyOutcome::Violation));
        assert!(matches!(classify_response(0x22, &[0x7F, 0x10, 0x11]), ClassifyOutcome::Violation));
    }

    #[test]
    fn entering_default_session_clears_security_level() {
        let mut session = UdsSession::new();
        session.security_level = 3;
        session.tester_present_enabled = true;
        session.enter_session(DEFAULT_SESSION);
        assert_eq!(session.security_level, 0);
        assert!(!session.tester_present_enabled);
    }

    // Shared test fixture: two ISO-TP endpoints (tester/ECU) talking over
    // one loopback transport, the same wiring used in `isotp::endpoint`'s
    // tests.
    struct LoopbackTransport(Arc<MockTransport>);

    #[async_trait::async_trait]
    impl crate::transport::Transport for LoopbackTransport {
        async fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, crate::error::TransportError> {
            self.0.recv(timeout).await
        }
        async fn send(&self, frame: CanFrame) -> Result<(), crate::error::TransportError> {
            self.0.send(frame.clone()).await?;
            self.0.inject(frame).await;
            Ok(())
        }
        async fn state(&self) -> crate::error::TransportState {
            self.0.state().await
        }
        async fn shutdown(&self) {
            self.0.shutdown().await
        }
    }

    async fn wire_pair() -> (Arc<Dispatcher>, Arc<IsoTpEndpoint>, Arc<IsoTpEndpoint>, tokio::task::JoinHandle<()>) {
        let transport = Arc::new(MockTransport::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Box::new(LoopbackTransport(transport)),
            DispatcherConfig::default(),
            CancellationToken::new(),
        ));
        let (h_tester, inbox_tester): (EndpointHandle, _) = dispatcher.register(0x7e8, 0x7e0).await.unwrap();
        let (h_ecu, inbox_ecu): (EndpointHandle, _) = dispatcher.register(0x7e0, 0x7e8).await.unwrap();
        let tester = IsoTpEndpoint::spawn(h_tester, dispatcher.clone(), inbox_tester, EndpointConfig::default(), CancellationToken::new());
        let ecu = IsoTpEndpoint::spawn(h_ecu, dispatcher.clone(), inbox_ecu, EndpointConfig::default(), CancellationToken::new());
        let d = dispatcher.clone();
        let run = tokio::spawn(async move { d.run().await });
        (dispatcher, tester, ecu, run)
    }

    #[tokio::test]
    async fn scenario_3_security_unlock_xor() {
        let (dispatcher, tester, ecu, run) = wire_pair().await;
        let client = UdsClient::spawn(tester, UdsClientConfig::default(), CancellationToken::new());

        let ecu_task = tokio::spawn(async move {
            let seed_req = ecu.recv_pdu().await.unwrap();
            assert_eq!(seed_req, vec![0x27, 0x01]);
            ecu.send_pdu(&[0x67, 0x01, 0x12, 0x34, 0x56, 0x78]).await.unwrap();

            let key_req = ecu.recv_pdu().await.unwrap();
            assert_eq!(key_req, vec![0x27, 0x02, 0x26, 0x26, 0x62, 0x6A]);
            ecu.send_pdu(&[0x67, 0x02]).await.unwrap();
        });

        client.security_access(0x01, &Algorithm::Xor { constant: 0x1234 }).await.unwrap();
        ecu_task.await.unwrap();
        assert_eq!(client.session().await.security_level, 1);

        dispatcher.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn nrc_0x78_pending_retries_until_final_response() {
        let (dispatcher, tester, ecu, run) = wire_pair().await;
        let mut config = UdsClientConfig::default();
        config.default_timeout = Duration::from_millis(100);
        config.default_p2_ext = Duration::from_secs(2);
        let client = UdsClient::spawn(tester, config, CancellationToken::new());

        let ecu_task = tokio::spawn(async move {
            let req = ecu.recv_pdu().await.unwrap();
            assert_eq!(req, vec![0x31, 0x01, 0xF0, 0x00]);
            ecu.send_pdu(&[0x7F, 0x31, 0x78]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            ecu.send_pdu(&[0x71, 0x01, 0xF0, 0x00, 0x00]).await.unwrap();
        });

        let payload = client.routine_control(0x01, 0xF000, &[]).await.unwrap();
        assert_eq!(payload, vec![0xF0, 0x00, 0x00]);
        ecu_task.await.unwrap();

        dispatcher.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn negative_response_is_surfaced_both_as_error_and_as_observer_event() {
        let (dispatcher, tester, ecu, run) = wire_pair().await;
        let client = UdsClient::spawn(tester, UdsClientConfig::default(), CancellationToken::new());
        let mut responses = client.subscribe_responses();

        let ecu_task = tokio::spawn(async move {
            let req = ecu.recv_pdu().await.unwrap();
            assert_eq!(req, vec![0x22, 0xF1, 0x90]);
            ecu.send_pdu(&[0x7F, 0x22, 0x31]).await.unwrap();
        });

        let err = client.read_did(0xF190).await.unwrap_err();
        assert_eq!(err, UdsError::Negative(Nrc::REQUEST_OUT_OF_RANGE));
        ecu_task.await.unwrap();

        let (_correlation_id, observed) = tokio::time::timeout(Duration::from_secs(1), responses.recv()).await.unwrap().unwrap();
        match observed.unwrap() {
            UdsResponse::Negative { service_id, nrc } => {
                assert_eq!(service_id, 0x22);
                assert_eq!(nrc, Nrc::REQUEST_OUT_OF_RANGE);
            }
            other => panic!("expected Negative, got {other:?}"),
        }

        dispatcher.cancel();
        run.await.unwrap();
    }
}
