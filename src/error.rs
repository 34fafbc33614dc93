//! Crate-wide error types.
//!
//! Every component defines its own small error enum for the failure modes
//! it can produce locally; all of them convert into [`CoreError`], the type
//! callers of [`crate::BusCore`] actually see. This mirrors the corpus
//! convention of one `thiserror`-derived enum per concern rather than a
//! single flat error type.

use std::fmt;

use crate::uds::Nrc;

/// Current connectivity state of a [`crate::transport::Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Disconnected,
    BusOff,
    Error,
}

/// Errors surfaced by a [`crate::transport::Transport`] implementation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No frame arrived within the requested timeout. Not fatal: callers
    /// (in practice, only the dispatcher) simply loop again.
    #[error("receive timed out")]
    Timeout,
    /// Bus-off, a cable pull, or a driver fault. The adapter is now
    /// disconnected and every in-flight operation fails with this.
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    /// Any other I/O-level failure that isn't a timeout.
    #[error("transport error: {0}")]
    Io(String),
}

/// Errors raised by an [`crate::isotp::IsoTpEndpoint`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IsoTpError {
    #[error("no response to single/first frame within N_As")]
    TimeoutNAs,
    #[error("flow control wait exceeded N_Bs (or 8 consecutive WAITs)")]
    TimeoutNBs,
    #[error("no consecutive frame within N_Cr")]
    TimeoutNCr,
    #[error("unexpected consecutive frame sequence number: expected {expected}, got {got}")]
    SequenceError { expected: u8, got: u8 },
    #[error("remote flow control reported overflow")]
    OverflowRemote,
    #[error("local reassembly buffer exceeded 4095 bytes")]
    OverflowLocal,
    #[error("malformed N_PCI byte: {0:#04x}")]
    MalformedPci(u8),
    #[error("PDU length {0} is out of range for this frame type")]
    InvalidLength(usize),
    #[error("endpoint transfer aborted")]
    Aborted,
    #[error("endpoint was cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised by the [`crate::uds::UdsClient`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UdsError {
    /// Peer returned a negative response (`0x7F`) with this NRC.
    #[error("negative response: {0}")]
    Negative(Nrc),
    /// No positive or negative response arrived within P2/P2_ext.
    #[error("no response within P2/P2_ext")]
    Timeout,
    /// The response didn't match any known positive/negative pattern.
    #[error("malformed or mismatched response")]
    ProtocolViolation,
    /// The request queue for this endpoint is full.
    #[error("request queue full")]
    QueueFull,
    /// The request was cancelled before completion.
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    IsoTp(#[from] IsoTpError),
    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// Errors raised by the [`crate::security::SecurityEngine`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("seed/key length mismatch: seed was {seed_len} bytes, key was {key_len}")]
    LengthMismatch { seed_len: usize, key_len: usize },
    #[error("external security provider returned an error: {0}")]
    ProviderFailed(String),
    #[error("external security provider exceeded its 500ms deadline")]
    ProviderTimeout,
    #[error("peer rejected the computed key")]
    KeyRejected,
}

/// Errors raised by the [`crate::scheduler::TransmitScheduler`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("period must be at least 1ms, got {0}ms")]
    InvalidPeriod(u64),
    #[error("job not found (already cancelled or completed)")]
    UnknownJob,
}

/// Top-level error type returned from [`crate::BusCore`]'s public API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    IsoTp(#[from] IsoTpError),
    #[error(transparent)]
    Uds(#[from] UdsError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// An endpoint registration collided with one already bound to the
    /// same `rx_id`.
    #[error("rx_id {0:#x} is already bound to an endpoint")]
    DuplicateRxId(u32),
    /// The handle's `rx_id` has no endpoint registered (never registered,
    /// or already torn down via `unregister_isotp`).
    #[error("no endpoint registered for rx_id {0:#x}")]
    UnknownEndpoint(u32),
    #[error("operation cancelled")]
    Cancelled,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::BusOff => "bus-off",
            TransportState::Error => "error",
        };
        write!(f, "{s}")
    }
}
