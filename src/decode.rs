//! The decode/encode façade (C7): a thin seam to an externally supplied
//! message database. The core never interprets DBC semantics itself — it
//! only routes frames through whatever implementation is attached.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::frame::CanFrame;

/// A named, numeric signal value decoded from (or destined for) a frame.
pub type Signals = HashMap<String, f64>;

/// External message database seam (spec §4.7, §6). Implementations are
/// supplied by the embedding application; this crate ships none beyond
/// [`NullDecoder`].
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Decode a frame's signals, or `None` if the frame's id isn't in the
    /// attached database.
    async fn decode(&self, frame: &CanFrame) -> Option<Signals>;

    /// Encode a named message's signals into `(id, extended, data)`, or
    /// `None` if the message isn't in the attached database.
    async fn encode(&self, message_name: &str, signals: &Signals) -> Option<(u32, bool, Vec<u8>)>;
}

/// Default façade used when no message database is attached: every frame
/// decodes to `None` and no message can be encoded. This is a placeholder,
/// not a real implementation — `BusCore` needs *some* `Decoder` to
/// construct, and callers that don't care about signal decoding shouldn't
/// have to write one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDecoder;

#[async_trait]
impl Decoder for NullDecoder {
    async fn decode(&self, _frame: &CanFrame) -> Option<Signals> {
        None
    }

    async fn encode(&self, _message_name: &str, _signals: &Signals) -> Option<(u32, bool, Vec<u8>)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Direction;

    #[tokio::test]
    async fn null_decoder_never_decodes_or_encodes() {
        let decoder = NullDecoder;
        let frame = CanFrame::new(0x123, false, vec![1, 2, 3], 0, Direction::Rx).unwrap();
        assert_eq!(decoder.decode(&frame).await, None);
        assert_eq!(decoder.encode("EngineStatus", &Signals::new()).await, None);
    }
}
