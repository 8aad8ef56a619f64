//! Folds protocol events into one growing answer text.
//!
//! Text normalization:
//! - `{}` noise markers are removed from flat chunks.
//! - Model-name echoes (a JSON object with `model` but no text field) are dropped.
//! - Flat fragments are joined with exactly one space unless either side
//!   already has whitespace at the seam.
//! - Delta fragments carry their own whitespace and are appended verbatim.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatStreamError, CoreResult};
use crate::model::DeltaChunk;
use crate::stream::{BoxEventStream, ProtocolEvent};

const NOISE_MARKER: &str = "{}";

/// How `data` payloads are interpreted.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Payload is free text.
    Flat,
    /// Payload is a `{ choices: [{ delta: { content? } }] }` chunk.
    Delta,
    /// Lock from the first metadata event, otherwise sniff each chunk.
    #[default]
    Auto,
}

impl std::str::FromStr for Dialect {
    type Err = ChatStreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "delta" => Ok(Self::Delta),
            "auto" => Ok(Self::Auto),
            other => Err(ChatStreamError::Validation(format!(
                "unknown dialect {other:?} (expected flat, delta or auto)"
            ))),
        }
    }
}

/// Running answer text plus terminal flag.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct AccumulationState {
    pub text: String,
    pub terminal: bool,
}

/// Owns the accumulation state for one session.
#[derive(Debug)]
pub struct Accumulator {
    state: AccumulationState,
    dialect: Dialect,
    sniffed: bool,
    metadata: Vec<Value>,
}

impl Accumulator {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            state: AccumulationState::default(),
            dialect,
            sniffed: false,
            metadata: Vec::new(),
        }
    }

    pub fn state(&self) -> &AccumulationState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.terminal
    }

    /// Dialect currently in effect (`Auto` until locked by metadata).
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Metadata payloads seen so far, in arrival order.
    pub fn metadata(&self) -> &[Value] {
        &self.metadata
    }

    /// Apply one event. Returns a snapshot when the state changed; `Done`
    /// always yields a terminal snapshot. Events after terminal are ignored.
    pub fn apply(&mut self, event: ProtocolEvent) -> Option<AccumulationState> {
        if self.state.terminal {
            return None;
        }
        match event {
            ProtocolEvent::Metadata(v) => {
                if !self.sniffed && self.dialect == Dialect::Auto {
                    self.sniffed = true;
                    if let Some(locked) = dialect_hint(&v) {
                        tracing::debug!(dialect = ?locked, "dialect locked by metadata");
                        self.dialect = locked;
                    }
                }
                tracing::debug!(metadata = %v, "stream metadata");
                self.metadata.push(v);
                None
            }
            ProtocolEvent::DataChunk(payload) => {
                let (fragment, dialect) = extract(self.dialect, &payload)?;
                self.append(&fragment, dialect).then(|| self.state.clone())
            }
            ProtocolEvent::Done => {
                self.state.terminal = true;
                Some(self.state.clone())
            }
        }
    }

    fn append(&mut self, fragment: &str, dialect: Dialect) -> bool {
        if fragment.is_empty() {
            return false;
        }
        if dialect == Dialect::Flat && needs_separator(&self.state.text, fragment) {
            self.state.text.push(' ');
        }
        self.state.text.push_str(fragment);
        true
    }
}

fn needs_separator(existing: &str, fragment: &str) -> bool {
    let ends_ws = existing.chars().next_back().is_some_and(char::is_whitespace);
    let starts_ws = fragment.chars().next().is_some_and(char::is_whitespace);
    !existing.is_empty() && !ends_ws && !starts_ws
}

fn dialect_hint(meta: &Value) -> Option<Dialect> {
    match meta.get("dialect").and_then(Value::as_str) {
        Some("delta") => return Some(Dialect::Delta),
        Some("flat") => return Some(Dialect::Flat),
        _ => {}
    }
    meta.get("object")
        .and_then(Value::as_str)
        .filter(|o| o.starts_with("chat.completion"))
        .map(|_| Dialect::Delta)
}

/// Turn a payload into appendable text plus the dialect that produced it.
/// `None` means the chunk carries nothing visible.
fn extract(dialect: Dialect, payload: &str) -> Option<(String, Dialect)> {
    match dialect {
        Dialect::Flat => extract_flat(payload).map(|t| (t, Dialect::Flat)),
        Dialect::Delta => extract_delta(payload).map(|t| (t, Dialect::Delta)),
        Dialect::Auto => {
            let parsed = serde_json::from_str::<Value>(payload).ok();
            if parsed.as_ref().and_then(|v| v.get("choices")).is_some() {
                extract_delta(payload).map(|t| (t, Dialect::Delta))
            } else {
                extract_flat(payload).map(|t| (t, Dialect::Flat))
            }
        }
    }
}

fn extract_flat(payload: &str) -> Option<String> {
    if is_model_echo(payload) {
        tracing::trace!(payload, "dropping model echo");
        return None;
    }
    let cleaned = payload.replace(NOISE_MARKER, "");
    (!cleaned.is_empty()).then_some(cleaned)
}

fn is_model_echo(payload: &str) -> bool {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(payload) else {
        return false;
    };
    let has_text = ["content", "text"]
        .iter()
        .any(|k| obj.get(*k).is_some_and(Value::is_string));
    obj.contains_key("model") && !has_text
}

fn extract_delta(payload: &str) -> Option<String> {
    let chunk = match serde_json::from_str::<DeltaChunk>(payload) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "dropping unparseable delta chunk");
            return None;
        }
    };
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    (!text.is_empty()).then_some(text)
}

/// Boxed stream of accumulation snapshots.
pub type BoxSnapshotStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = CoreResult<AccumulationState>> + Send>>;

/// Drive `acc` over `events`, yielding one snapshot per state change.
///
/// Stops pulling after the terminal snapshot. If the events end without
/// `Done`, the last item is `IncompleteStream` carrying the partial text; a
/// decode/transport error is passed through as the last item.
pub fn snapshots(events: BoxEventStream, acc: Accumulator) -> BoxSnapshotStream {
    Box::pin(futures::stream::unfold(
        Some((events, acc)),
        |slot| async move {
            let (mut events, mut acc) = slot?;
            loop {
                match events.next().await {
                    Some(Ok(ev)) => {
                        if let Some(snap) = acc.apply(ev) {
                            let next = (!snap.terminal).then_some((events, acc));
                            return Some((Ok(snap), next));
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), None)),
                    None => {
                        let partial = acc.state().text.clone();
                        return Some((Err(ChatStreamError::IncompleteStream { partial }), None));
                    }
                }
            }
        },
    ))
}
