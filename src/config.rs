//! Construction-time configuration. No global singletons (spec §9): every
//! knob the core needs is threaded through a `CoreConfig` at construction,
//! so multiple cores (e.g. two physical buses) may coexist in one process.

use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::isotp::EndpointConfig;
use crate::uds::UdsClientConfig;

/// Top-level configuration for a [`crate::BusCore`].
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub dispatcher: DispatcherConfig,
    pub default_endpoint: EndpointConfig,
    pub default_uds: UdsClientConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            dispatcher: DispatcherConfig::default(),
            default_endpoint: EndpointConfig::default(),
            default_uds: UdsClientConfig::default(),
        }
    }
}

/// Per-`register_isotp` overrides (spec §6 control surface).
#[derive(Debug, Clone, Default)]
pub struct RegisterIsoTpOptions {
    pub padding_byte: Option<u8>,
    pub rx_block_size: Option<u8>,
    pub rx_separation_time_raw: Option<u8>,
    pub p2: Option<Duration>,
    pub p2_ext: Option<Duration>,
}
