//! Line framing for the chat stream protocol.
//!
//! The wire format is newline-delimited `<field>:<payload>` lines:
//!
//! ```text
//! metadata: {"conversation_id": "c-1"}
//! data: Here
//! data: is
//! done:
//! ```
//!
//! The decoder only frames lines and extracts payload strings. It does not
//! know whether a `data` payload is flat text or a serialized delta chunk;
//! that is decided by the accumulator.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::Stream;

use crate::error::CoreResult;
use crate::stream::{ByteStream, ProtocolEvent};

const NESTED_DATA_PREFIX: &str = "data:";
const DELTA_DONE_MARKER: &str = "[DONE]";

/// Incremental, transport-agnostic line decoder.
///
/// Bytes are buffered until a `\n` arrives; only complete lines are decoded,
/// so the output does not depend on how the input was fragmented.
#[derive(Debug, Default)]
pub struct LineDecoder {
    carry: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly arrived bytes; returns the events completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent> {
        self.carry.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut start = 0;
        while let Some(rel) = self.carry[start..].iter().position(|b| *b == b'\n') {
            let end = start + rel;
            let line = String::from_utf8_lossy(&self.carry[start..end]);
            if let Some(ev) = classify_line(&line) {
                out.push(ev);
            }
            start = end + 1;
        }
        self.carry.drain(..start);
        out
    }

    /// Bytes received after the last newline.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Drop the unterminated tail; returns how many bytes were discarded.
    pub fn discard_tail(&mut self) -> usize {
        let n = self.carry.len();
        self.carry.clear();
        n
    }
}

/// Classify one complete line (without its `\n`).
pub fn classify_line(line: &str) -> Option<ProtocolEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return None;
    }
    let (field, rest) = line.split_once(':').unwrap_or((line, ""));

    match field.trim() {
        "done" => Some(ProtocolEvent::Done),
        "data" => {
            let payload = extract_payload(rest)?;
            if payload == DELTA_DONE_MARKER {
                return Some(ProtocolEvent::Done);
            }
            Some(ProtocolEvent::DataChunk(payload.to_string()))
        }
        "metadata" => {
            let payload = extract_payload(rest)?;
            match serde_json::from_str::<serde_json::Value>(payload) {
                Ok(v) => Some(ProtocolEvent::Metadata(v)),
                Err(e) => {
                    tracing::warn!(error = %e, payload, "dropping malformed metadata line");
                    None
                }
            }
        }
        other => {
            tracing::trace!(field = other, "skipping line with unknown field");
            None
        }
    }
}

/// Trimmed payload, with one nested `data:` prefix removed. `None` if nothing remains.
fn extract_payload(rest: &str) -> Option<&str> {
    let trimmed = rest.trim();
    let payload = match trimmed.strip_prefix(NESTED_DATA_PREFIX) {
        Some(inner) => inner.trim(),
        None => trimmed,
    };
    (!payload.is_empty()).then_some(payload)
}

/// Single-use stream of protocol events over a transport body.
///
/// Ends when the body ends (an unterminated tail is discarded) or right after
/// yielding the first transport error.
pub struct EventStream {
    inner: ByteStream,
    decoder: LineDecoder,
    queue: VecDeque<ProtocolEvent>,
    finished: bool,
}

impl EventStream {
    pub fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            decoder: LineDecoder::new(),
            queue: VecDeque::new(),
            finished: false,
        }
    }
}

impl Stream for EventStream {
    type Item = CoreResult<ProtocolEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(ev) = self.queue.pop_front() {
                return Poll::Ready(Some(Ok(ev)));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let events = self.decoder.feed(&chunk);
                    self.queue.extend(events);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    self.queue.clear();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    let dropped = self.decoder.discard_tail();
                    if dropped > 0 {
                        tracing::debug!(bytes = dropped, "discarding unterminated trailing line");
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatStreamError;
    use bytes::Bytes;
    use futures::StreamExt;
    use serde_json::json;

    const WIRE: &str = "metadata: {\"conversation_id\":\"c-1\"}\n\
                        data: Here\n\
                        \n\
                        data: is caf\u{e9} \u{1f600}\n\
                        data: {}\n\
                        done:\n";

    fn expected() -> Vec<ProtocolEvent> {
        vec![
            ProtocolEvent::Metadata(json!({"conversation_id": "c-1"})),
            ProtocolEvent::DataChunk("Here".into()),
            ProtocolEvent::DataChunk("is caf\u{e9} \u{1f600}".into()),
            ProtocolEvent::DataChunk("{}".into()),
            ProtocolEvent::Done,
        ]
    }

    fn body(chunks: Vec<CoreResult<Bytes>>) -> ByteStream {
        Box::pin(futures::stream::iter(chunks))
    }

    async fn collect(chunks: Vec<CoreResult<Bytes>>) -> Vec<CoreResult<ProtocolEvent>> {
        EventStream::new(body(chunks)).collect().await
    }

    #[test]
    fn classifies_fields() {
        assert_eq!(
            classify_line("data:   spaced out  "),
            Some(ProtocolEvent::DataChunk("spaced out".into()))
        );
        assert_eq!(classify_line("done:"), Some(ProtocolEvent::Done));
        assert_eq!(classify_line("done"), Some(ProtocolEvent::Done));
        assert_eq!(classify_line("   "), None);
        assert_eq!(classify_line("data:"), None);
        assert_eq!(classify_line("data:   "), None);
        assert_eq!(classify_line("event: message"), None);
        assert_eq!(classify_line(": keep-alive"), None);
    }

    #[test]
    fn data_payload_keeps_everything_after_first_separator() {
        assert_eq!(
            classify_line(r#"data: {"choices":[{"delta":{"content":"a:b"}}]}"#),
            Some(ProtocolEvent::DataChunk(
                r#"{"choices":[{"delta":{"content":"a:b"}}]}"#.into()
            ))
        );
    }

    #[test]
    fn nested_data_prefix_is_stripped() {
        assert_eq!(
            classify_line("data: data: inner"),
            Some(ProtocolEvent::DataChunk("inner".into()))
        );
        assert_eq!(classify_line("data: data:"), None);
        assert_eq!(
            classify_line("metadata: data: {\"k\":1}"),
            Some(ProtocolEvent::Metadata(json!({"k": 1})))
        );
    }

    #[test]
    fn delta_done_marker_ends_stream() {
        assert_eq!(classify_line("data: [DONE]"), Some(ProtocolEvent::Done));
    }

    #[test]
    fn malformed_metadata_is_skipped() {
        let mut d = LineDecoder::new();
        let evs = d.feed(b"metadata: {not json\ndata: still here\n");
        assert_eq!(evs, vec![ProtocolEvent::DataChunk("still here".into())]);
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let mut d = LineDecoder::new();
        let evs = d.feed(b"data: one\r\ndone:\r\n");
        assert_eq!(
            evs,
            vec![ProtocolEvent::DataChunk("one".into()), ProtocolEvent::Done]
        );
    }

    #[test]
    fn fragmentation_invariance_one_byte_at_a_time() {
        let whole = LineDecoder::new().feed(WIRE.as_bytes());
        assert_eq!(whole, expected());

        let mut d = LineDecoder::new();
        let mut split = Vec::new();
        for b in WIRE.as_bytes() {
            split.extend(d.feed(std::slice::from_ref(b)));
        }
        assert_eq!(split, whole);
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn fragmentation_invariance_every_two_way_split() {
        let bytes = WIRE.as_bytes();
        for cut in 0..=bytes.len() {
            let mut d = LineDecoder::new();
            let mut evs = d.feed(&bytes[..cut]);
            evs.extend(d.feed(&bytes[cut..]));
            assert_eq!(evs, expected(), "split at byte {cut}");
        }
    }

    #[test]
    fn partial_line_is_carried_not_emitted() {
        let mut d = LineDecoder::new();
        assert!(d.feed(b"data: hel").is_empty());
        assert_eq!(d.pending(), 9);
        assert_eq!(
            d.feed(b"lo\n"),
            vec![ProtocolEvent::DataChunk("hello".into())]
        );
    }

    #[tokio::test]
    async fn stream_decodes_across_chunks() {
        let out = collect(vec![
            Ok(Bytes::from_static(b"data: He")),
            Ok(Bytes::from_static(b"re\ndata: is\nda")),
            Ok(Bytes::from_static(b"ta: X\ndone:\n")),
        ])
        .await;
        let evs: Vec<_> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(
            evs,
            vec![
                ProtocolEvent::DataChunk("Here".into()),
                ProtocolEvent::DataChunk("is".into()),
                ProtocolEvent::DataChunk("X".into()),
                ProtocolEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn unterminated_tail_is_discarded_at_end_of_stream() {
        let out = collect(vec![Ok(Bytes::from_static(b"data: kept\ndata: lost"))]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].as_ref().unwrap(),
            &ProtocolEvent::DataChunk("kept".into())
        );
    }

    #[tokio::test]
    async fn transport_error_ends_the_sequence() {
        let out = collect(vec![
            Ok(Bytes::from_static(b"data: one\ndata: two\n")),
            Err(ChatStreamError::Transport("reset".into())),
            Ok(Bytes::from_static(b"data: never\n")),
        ])
        .await;
        assert_eq!(out.len(), 3);
        assert!(out[0].is_ok());
        assert!(out[1].is_ok());
        assert!(matches!(out[2], Err(ChatStreamError::Transport(_))));
    }
}
