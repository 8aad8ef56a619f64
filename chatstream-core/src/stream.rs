//! Streaming primitives shared by the decoder, the accumulator and transports.
//!
//! Contract:
//! - A transport yields raw body chunks; a chunk boundary carries no meaning.
//! - The decoder turns those chunks into 0..n `ProtocolEvent`s, in arrival order.
//! - A transport error ends the byte stream; nothing is yielded after it.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::Stream;

use crate::error::CoreResult;

/// One decoded unit of the line protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Side-channel structured data; never contributes text.
    Metadata(serde_json::Value),
    /// Payload of a `data:` line, outer whitespace removed.
    DataChunk(String),
    /// Explicit end of the response.
    Done,
}

impl ProtocolEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn as_data(&self) -> Option<&str> {
        match self {
            Self::DataChunk(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Response body as handed over by a transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

/// Boxed stream of decoded protocol events.
pub type BoxEventStream = Pin<Box<dyn Stream<Item = CoreResult<ProtocolEvent>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_work() {
        let d = ProtocolEvent::DataChunk("hi".into());
        assert!(!d.is_terminal());
        assert_eq!(d.as_data(), Some("hi"));

        let done = ProtocolEvent::Done;
        assert!(done.is_terminal());
        assert_eq!(done.as_data(), None);
    }
}
