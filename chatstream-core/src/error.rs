use thiserror::Error;

/// Core error type for chatstream.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatStreamError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no bearer token available")]
    Unauthorized,

    #[error("another session is already in flight")]
    SessionBusy,

    #[error("rate limited by {endpoint}")]
    RateLimited {
        endpoint: String,
        retry_after: Option<u64>,
    },

    #[error("backend unavailable: {endpoint}")]
    Unavailable { endpoint: String },

    #[error("upstream error: {code} {message}")]
    Upstream { code: String, message: String },

    #[error("transport failed mid-stream: {0}")]
    Transport(String),

    #[error("stream ended before the done marker ({} chars received)", .partial.len())]
    IncompleteStream { partial: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatStreamError {
    /// Stable short name used for telemetry and the failure channel.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized => "unauthorized",
            Self::SessionBusy => "session_busy",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable { .. } => "unavailable",
            Self::Upstream { .. } => "upstream",
            Self::Transport(_) => "transport",
            Self::IncompleteStream { .. } => "incomplete_stream",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ChatStreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_stream_reports_partial_length() {
        let err = ChatStreamError::IncompleteStream {
            partial: "Hello".into(),
        };
        assert_eq!(err.kind(), "incomplete_stream");
        assert!(err.to_string().contains("5 chars"));
    }

    #[test]
    fn anyhow_converts_to_other() {
        let err: ChatStreamError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ChatStreamError::Other(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
