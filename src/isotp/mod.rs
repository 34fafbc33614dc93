//! ISO-TP (ISO 15765-2) segmentation, reassembly and flow control (C3).

pub mod endpoint;
pub mod frame;

pub use endpoint::{EndpointConfig, IsoTpEndpoint, ReassemblyState};
pub use frame::{FlowControlFrame, FlowStatus, PciFrame};
