//! UDS (ISO 14229) request/response client (C4): session and security
//! state, negative-response handling, and the tester-present keepalive on
//! top of one [`crate::isotp::IsoTpEndpoint`].

pub mod client;
pub mod types;

pub use client::{UdsClient, UdsClientConfig};
pub use types::{CorrelationId, Nrc, UdsRequest, UdsResponse, UdsSession};
