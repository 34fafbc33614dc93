//! Value types shared by the UDS client: the negative-response-code
//! newtype, session state, and the request/response records exchanged
//! across a correlation id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Negative Response Code. Kept as an open byte rather than a closed enum:
/// non-compliant ECUs occasionally return NRCs outside ISO 14229's table,
/// and those must still be representable, not rejected at the parse step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nrc(pub u8);

impl Nrc {
    pub const GENERAL_REJECT: Nrc = Nrc(0x10);
    pub const SERVICE_NOT_SUPPORTED: Nrc = Nrc(0x11);
    pub const SUB_FUNCTION_NOT_SUPPORTED: Nrc = Nrc(0x12);
    pub const INCORRECT_MESSAGE_LENGTH: Nrc = Nrc(0x13);
    pub const CONDITIONS_NOT_CORRECT: Nrc = Nrc(0x22);
    pub const REQUEST_OUT_OF_RANGE: Nrc = Nrc(0x31);
    pub const SECURITY_ACCESS_DENIED: Nrc = Nrc(0x33);
    pub const INVALID_KEY: Nrc = Nrc(0x35);
    pub const EXCEEDED_ATTEMPTS: Nrc = Nrc(0x36);
    pub const REQUIRED_TIME_DELAY_NOT_EXPIRED: Nrc = Nrc(0x37);
    pub const RESPONSE_PENDING: Nrc = Nrc(0x78);

    pub fn is_response_pending(self) -> bool {
        self == Nrc::RESPONSE_PENDING
    }
}

impl std::fmt::Display for Nrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl From<u8> for Nrc {
    fn from(v: u8) -> Self {
        Nrc(v)
    }
}

/// Monotonically issued id correlating a [`UdsRequest`] with its eventual
/// [`UdsResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u64);

#[derive(Default)]
pub(crate) struct CorrelationIdSource(AtomicU64);

impl CorrelationIdSource {
    pub(crate) fn next(&self) -> CorrelationId {
        CorrelationId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Default UDS session type (no programming, no extended diagnostics).
pub const DEFAULT_SESSION: u8 = 0x01;
/// Default P2 (normal response timeout).
pub const DEFAULT_P2: Duration = Duration::from_millis(1000);
/// Default P2_ext (extended timeout after an NRC 0x78 "response pending").
pub const DEFAULT_P2_EXT: Duration = Duration::from_millis(5000);
/// Default tester-present keepalive period.
pub const DEFAULT_TESTER_PRESENT_PERIOD: Duration = Duration::from_secs(2);
/// Consecutive tester-present failures before the session is demoted.
pub const TESTER_PRESENT_FAILURE_LIMIT: u8 = 3;

/// Process-wide diagnostic state for one UDS endpoint (spec §3).
///
/// Invariant: `session_type == 0x01` implies `security_level == 0` —
/// entering the default session always clears security.
#[derive(Debug, Clone)]
pub struct UdsSession {
    pub session_type: u8,
    pub security_level: u8,
    pub tester_present_enabled: bool,
    pub last_activity_monotonic: std::time::Instant,
}

impl UdsSession {
    pub fn new() -> Self {
        UdsSession {
            session_type: DEFAULT_SESSION,
            security_level: 0,
            tester_present_enabled: false,
            last_activity_monotonic: std::time::Instant::now(),
        }
    }

    pub(crate) fn enter_session(&mut self, session_type: u8) {
        self.session_type = session_type;
        if session_type == DEFAULT_SESSION {
            self.security_level = 0;
            self.tester_present_enabled = false;
        }
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity_monotonic = std::time::Instant::now();
    }
}

impl Default for UdsSession {
    fn default() -> Self {
        Self::new()
    }
}

/// A UDS request, as submitted by a caller.
#[derive(Debug, Clone)]
pub struct UdsRequest {
    pub service_id: u8,
    pub sub_function: Option<u8>,
    pub payload: Vec<u8>,
    pub timeout: Duration,
    pub p2_ext: Duration,
    pub correlation_id: CorrelationId,
}

impl UdsRequest {
    pub(crate) fn bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.payload.len());
        bytes.push(self.service_id);
        if let Some(sub) = self.sub_function {
            bytes.push(sub);
        }
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// A classified UDS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsResponse {
    /// `response.service_id == request.service_id + 0x40` (spec §8).
    Positive { service_id: u8, payload: Vec<u8> },
    Negative { service_id: u8, nrc: Nrc },
}
