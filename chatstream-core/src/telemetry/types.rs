use serde::{Deserialize, Serialize};

/// One record per finished chat session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionTrace {
    pub session_id: String,

    /// Transport name, e.g. "chat-api", "scripted".
    pub transport: String,

    /// "completed", "cancelled" or "failed".
    pub outcome: String,

    /// Time from start to the response headers, if they arrived.
    pub first_byte_ms: Option<u64>,

    /// Time from start to the terminal state.
    pub latency_ms: u64,

    /// Snapshots applied to the assistant message.
    pub snapshots: u32,

    /// Length of the final (or last partial) text, in chars.
    pub chars: usize,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl SessionTrace {
    pub fn new(session_id: impl Into<String>, transport: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            transport: transport.into(),
            ..Default::default()
        }
    }

    pub fn outcome(mut self, outcome: &str) -> Self {
        self.outcome = outcome.to_string();
        self
    }

    pub fn first_byte_ms(mut self, ms: Option<u64>) -> Self {
        self.first_byte_ms = ms;
        self
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn progress(mut self, snapshots: u32, chars: usize) -> Self {
        self.snapshots = snapshots;
        self.chars = chars;
        self
    }

    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_trace_serializes() {
        let trace = SessionTrace::new("s-1", "chat-api")
            .outcome("failed")
            .first_byte_ms(Some(12))
            .latency_ms(40)
            .progress(3, 9)
            .error("incomplete_stream", "ended early");

        let as_json = serde_json::to_value(&trace).unwrap();
        assert_eq!(as_json["session_id"], json!("s-1"));
        assert_eq!(as_json["outcome"], json!("failed"));
        assert_eq!(as_json["first_byte_ms"], json!(12));
        assert_eq!(as_json["snapshots"], json!(3));
        assert_eq!(as_json["error_kind"], json!("incomplete_stream"));
    }
}
