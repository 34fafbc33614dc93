//! A concurrent CAN/ISO-TP/UDS protocol core.
//!
//! [`BusCore`] wires together the transport adapter (C1), dispatcher (C2),
//! ISO-TP endpoints (C3), UDS client (C4), security engine (C5), transmit
//! scheduler (C6) and decode façade (C7) behind the control surface
//! described in the crate's design notes: `connect`/`disconnect`,
//! `register_isotp`, `uds_request`, `security_access`, `schedule`.
//!
//! No global state: every `BusCore` is an independent instance, so a
//! process may run more than one (e.g. two physical buses) side by side.

pub mod config;
pub mod decode;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod isotp;
pub mod scheduler;
pub mod security;
pub mod transport;
pub mod uds;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

pub use config::{CoreConfig, RegisterIsoTpOptions};
use decode::Decoder;
use dispatcher::{Dispatcher, EndpointHandle};
pub use error::CoreError;
use frame::CanFrame;
use isotp::IsoTpEndpoint;
use scheduler::{JobId, TransmitScheduler};
use security::Algorithm;
use transport::Transport;
use uds::UdsClient;

struct EndpointEntry {
    endpoint: Arc<IsoTpEndpoint>,
    uds: Arc<UdsClient>,
    cancel: CancellationToken,
}

/// The running protocol core. Construct with [`BusCore::connect`]; tear
/// down with [`BusCore::shutdown`] (idempotent, cancels every task this
/// core owns).
pub struct BusCore {
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<TransmitScheduler>,
    decoder: Arc<dyn Decoder>,
    endpoints: RwLock<HashMap<u32, EndpointEntry>>,
    config: CoreConfig,
    cancel: CancellationToken,
}

impl BusCore {
    /// Take ownership of `transport` and start the dispatcher's receive
    /// loop and the transmit scheduler. Per the single-receive-source
    /// discipline, nothing outside the dispatcher ever touches `transport`
    /// again.
    pub fn connect(transport: Box<dyn Transport>, decoder: Arc<dyn Decoder>, config: CoreConfig) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(transport, config.dispatcher.clone(), cancel.child_token()));
        let scheduler = TransmitScheduler::spawn(dispatcher.clone(), cancel.child_token());

        let core = Arc::new(BusCore {
            dispatcher: dispatcher.clone(),
            scheduler,
            decoder,
            endpoints: RwLock::new(HashMap::new()),
            config,
            cancel,
        });

        tokio::spawn(async move { dispatcher.run().await });

        core
    }

    /// Cancel every task this core owns (dispatcher, scheduler, every
    /// registered ISO-TP endpoint and UDS client) and disconnect the
    /// transport. Idempotent.
    pub async fn disconnect(&self) {
        self.shutdown().await;
    }

    /// Same as [`BusCore::disconnect`].
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.dispatcher.cancel();
    }

    /// Subscribe to the live frame broadcast (never blocks the core; a slow
    /// subscriber drops frames instead).
    pub fn subscribe_frames(&self) -> broadcast::Receiver<CanFrame> {
        self.dispatcher.subscribe()
    }

    /// Snapshot of the last frames observed, oldest first.
    pub async fn recent_frames(&self) -> Vec<CanFrame> {
        self.dispatcher.recent_frames().await
    }

    pub async fn transport_state(&self) -> error::TransportState {
        self.dispatcher.transport_state().await
    }

    /// Decode a frame through the attached [`Decoder`], if any signal
    /// database covers it.
    pub async fn decode(&self, frame: &CanFrame) -> Option<decode::Signals> {
        self.decoder.decode(frame).await
    }

    /// Register a new ISO-TP endpoint and the UDS client running over it.
    /// Fails if `rx_id` is already bound to another endpoint (spec §3: the
    /// `rx_id -> endpoint` mapping is injective).
    pub async fn register_isotp(&self, tx_id: u32, rx_id: u32, options: RegisterIsoTpOptions) -> Result<EndpointHandle, CoreError> {
        let (handle, inbox) = self.dispatcher.register(rx_id, tx_id).await?;

        let mut endpoint_config = self.config.default_endpoint.clone();
        if let Some(p) = options.padding_byte {
            endpoint_config.padding_byte = p;
        }
        if let Some(bs) = options.rx_block_size {
            endpoint_config.rx_block_size = bs;
        }
        if let Some(st) = options.rx_separation_time_raw {
            endpoint_config.rx_separation_time_raw = st;
        }

        let endpoint_cancel = self.cancel.child_token();
        let endpoint = IsoTpEndpoint::spawn(handle, self.dispatcher.clone(), inbox, endpoint_config, endpoint_cancel.clone());

        let mut uds_config = self.config.default_uds.clone();
        if let Some(p2) = options.p2 {
            uds_config.default_timeout = p2;
        }
        if let Some(p2_ext) = options.p2_ext {
            uds_config.default_p2_ext = p2_ext;
        }
        let uds = UdsClient::spawn(endpoint.clone(), uds_config, endpoint_cancel.clone());

        let mut endpoints = self.endpoints.write().await;
        endpoints.insert(rx_id, EndpointEntry { endpoint, uds, cancel: endpoint_cancel });

        Ok(handle)
    }

    /// Tear down a previously registered endpoint and its UDS client.
    pub async fn unregister_isotp(&self, handle: EndpointHandle) {
        let mut endpoints = self.endpoints.write().await;
        if let Some(entry) = endpoints.remove(&handle.rx_id()) {
            entry.cancel.cancel();
        }
        drop(endpoints);
        self.dispatcher.unregister(handle).await;
    }

    async fn uds_client(&self, handle: EndpointHandle) -> Result<Arc<UdsClient>, CoreError> {
        let endpoints = self.endpoints.read().await;
        endpoints.get(&handle.rx_id()).map(|e| e.uds.clone()).ok_or(CoreError::UnknownEndpoint(handle.rx_id()))
    }

    /// Submit a UDS request on a registered endpoint using its default
    /// timeouts.
    pub async fn uds_request(&self, handle: EndpointHandle, service_id: u8, sub_function: Option<u8>, payload: Vec<u8>) -> Result<Vec<u8>, CoreError> {
        let client = self.uds_client(handle).await?;
        Ok(client.request(service_id, sub_function, payload).await?)
    }

    /// Drive a UDS Security Access (0x27) seed/key exchange on a registered
    /// endpoint.
    pub async fn security_access(&self, handle: EndpointHandle, level: u8, algorithm: &Algorithm) -> Result<(), CoreError> {
        let client = self.uds_client(handle).await?;
        Ok(client.security_access(level, algorithm).await?)
    }

    /// Access the UDS client directly, for the thin wrappers
    /// (`read_did`, `session_control`, `ecu_reset`, …) not mirrored on
    /// `BusCore` itself.
    pub async fn uds_client_handle(&self, handle: EndpointHandle) -> Result<Arc<UdsClient>, CoreError> {
        self.uds_client(handle).await
    }

    pub async fn send_once(&self, frame: CanFrame) -> Result<(), error::TransportError> {
        self.scheduler.send_once(frame).await
    }

    pub async fn send_burst(&self, frame: CanFrame, count: u32, gap: Duration) -> Result<(), error::TransportError> {
        self.scheduler.send_burst(frame, count, gap).await
    }

    pub async fn schedule_periodic(&self, frame: CanFrame, period: Duration, count: Option<u32>) -> Result<JobId, CoreError> {
        Ok(self.scheduler.send_periodic(frame, period, count).await?)
    }

    pub async fn cancel_schedule(&self, job: JobId) {
        self.scheduler.cancel(job).await;
    }
}
