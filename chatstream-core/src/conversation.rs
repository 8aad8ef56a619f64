use std::sync::Mutex;

use crate::model::Message;

/// Ordered message list of one conversation.
///
/// Only finished messages are appended: user messages, completed or
/// cancelled assistant messages. Provisional messages live on the update
/// channel until they are frozen.
pub trait Conversation: Send + Sync {
    fn append_message(&self, message: Message);
    fn messages(&self) -> Vec<Message>;
}

#[derive(Debug, Default)]
pub struct InMemoryConversation {
    messages: Mutex<Vec<Message>>,
}

impl InMemoryConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(history),
        }
    }
}

impl Conversation for InMemoryConversation {
    fn append_message(&self, message: Message) {
        let mut guard = self.messages.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(message);
    }

    fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
