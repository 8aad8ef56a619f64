use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Opaque identifier of a document attached to a prompt.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct DocumentRef(pub String);

impl DocumentRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One entry of a conversation.
///
/// User messages are immutable once created. An assistant message is
/// provisional (`is_streaming = true`) while its session runs and is frozen
/// exactly once when the session completes or is cancelled.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at_ms: i64,
    pub is_streaming: bool,
    #[serde(default)]
    pub document_refs: BTreeSet<DocumentRef>,
}

impl Message {
    pub fn user(
        id: impl Into<String>,
        content: impl Into<String>,
        refs: BTreeSet<DocumentRef>,
    ) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: content.into(),
            created_at_ms: now_ms(),
            is_streaming: false,
            document_refs: refs,
        }
    }

    pub fn provisional_assistant(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: String::new(),
            created_at_ms: now_ms(),
            is_streaming: true,
            document_refs: BTreeSet::new(),
        }
    }

    /// Replace the content with a newer snapshot. Returns `false` when the
    /// content was already identical (replayed snapshot) or the message is frozen.
    pub fn apply_snapshot(&mut self, text: &str) -> bool {
        if !self.is_streaming || self.content == text {
            return false;
        }
        self.content.clear();
        self.content.push_str(text);
        true
    }

    pub fn freeze(&mut self) {
        self.is_streaming = false;
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentRef,
    pub filename: String,
    pub title: String,
    pub content_type: String,
    pub size: u64,
    pub status: DocumentStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// What the session controller hands to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub text: String,
    pub document_refs: Vec<DocumentRef>,
}

// ---- Wire structs ----

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default)]
    pub document_ids: Vec<DocumentRef>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionResponse {
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionChoice {
    #[serde(default)]
    pub index: u32,
    pub message: WireMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl CompletionResponse {
    pub fn text(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default()
    }
}

/// Delta-dialect streaming chunk: `{ choices: [{ delta: { content? } }] }`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeltaChunk {
    pub choices: Vec<DeltaChoice>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeltaChoice {
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_replay_is_idempotent() {
        let mut msg = Message::provisional_assistant("a-1");
        assert!(msg.apply_snapshot("Hel"));
        assert!(!msg.apply_snapshot("Hel"));
        assert_eq!(msg.content, "Hel");
        assert!(msg.apply_snapshot("Hello the"));
        assert_eq!(msg.content, "Hello the");
    }

    #[test]
    fn frozen_message_ignores_snapshots() {
        let mut msg = Message::provisional_assistant("a-1");
        msg.apply_snapshot("done");
        msg.freeze();
        assert!(!msg.apply_snapshot("done and more"));
        assert_eq!(msg.content, "done");
        assert!(!msg.is_streaming);
    }

    #[test]
    fn completion_request_uses_backend_field_names() {
        let req = CompletionRequest {
            model: "claude-3-7-sonnet-20250219".into(),
            messages: vec![WireMessage {
                role: Role::User,
                content: "hi".into(),
            }],
            stream: true,
            max_tokens: 1000,
            temperature: 0.7,
            document_ids: vec![DocumentRef::from("doc-1")],
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["messages"][0]["role"], "user");
        assert_eq!(v["document_ids"][0], "doc-1");
        assert_eq!(v["stream"], true);
    }

    #[test]
    fn delta_chunk_tolerates_missing_content() {
        let chunk: DeltaChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(chunk.choices[0].delta.role, Some(Role::Assistant));
        assert_eq!(chunk.choices[0].delta.content, None);
    }

    #[test]
    fn completion_response_text_defaults_to_empty() {
        let resp: CompletionResponse =
            serde_json::from_str(r#"{"id":"c1","choices":[]}"#).unwrap();
        assert_eq!(resp.text(), "");
    }
}
