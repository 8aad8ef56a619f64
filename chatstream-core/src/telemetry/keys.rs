/// Span field keys for chat sessions.
/// Keep these stable; log pipelines filter on them.
pub const SPAN_SESSION: &str = "chat.session";

pub const KEY_SESSION_ID: &str = "session.id";
pub const KEY_TRANSPORT: &str = "session.transport";
pub const KEY_OUTCOME: &str = "session.outcome";
pub const KEY_SNAPSHOTS: &str = "session.snapshots";
pub const KEY_CHARS: &str = "session.chars";
pub const KEY_ERROR_KIND: &str = "error.kind";
