//! The in-memory conversation buffer.
//!
//! Scoped to the current agent session: rebuilt fresh on daemon restart
//! or explicit reset, never persisted directly. Completed runs persist
//! a snapshot into the session's context map.

use kronk_domain::chat::{ChatMessage, Role};

#[derive(Default)]
pub struct ConversationBuffer {
    messages: Vec<ChatMessage>,
}

impl ConversationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the leading system message.
    pub fn set_system(&mut self, content: String) {
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                first.content = content;
            }
            _ => self.messages.insert(0, ChatMessage::system(content)),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_system_replaces_in_place() {
        let mut buffer = ConversationBuffer::new();
        buffer.push(ChatMessage::user("hi"));
        buffer.set_system("first".into());
        buffer.set_system("second".into());

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.messages()[0].role, Role::System);
        assert_eq!(buffer.messages()[0].content, "second");
        assert_eq!(buffer.messages()[1].content, "hi");
    }
}
