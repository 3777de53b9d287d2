use std::collections::HashSet;

use shared::{
    domain::{ConversationId, MessageId},
    protocol::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Appended,
    /// Held back until the snapshot for the conversation lands.
    Buffered,
    Duplicate,
    /// Belongs to a conversation other than the displayed one.
    Foreign,
}

/// The displayed, arrival-ordered message sequence of one conversation.
///
/// Order is snapshot first, then live deliveries as they arrive; `sent_at` is
/// never used for sorting.
#[derive(Debug, Default)]
pub struct MessageStream {
    conversation: Option<ConversationId>,
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    awaiting_snapshot: bool,
    buffered: Vec<Message>,
}

impl MessageStream {
    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    /// Discards everything, including buffered deliveries, and binds the
    /// stream to `conversation`.
    pub fn reset(&mut self, conversation: Option<ConversationId>) {
        self.conversation = conversation;
        self.messages.clear();
        self.seen.clear();
        self.buffered.clear();
        self.awaiting_snapshot = conversation.is_some();
    }

    /// Replaces the sequence with `snapshot`, then appends deliveries that
    /// arrived while it was loading and are not part of it.
    pub fn apply_snapshot(&mut self, conversation: ConversationId, snapshot: Vec<Message>) -> bool {
        if self.conversation != Some(conversation) {
            return false;
        }
        self.messages.clear();
        self.seen.clear();
        for message in snapshot {
            if self.seen.insert(message.id) {
                self.messages.push(message);
            }
        }
        self.flush_buffered();
        true
    }

    /// The snapshot could not be loaded: nothing from history is shown, but
    /// live deliveries buffered during the load are kept, so the sequence
    /// holds only those (and is empty if none arrived).
    pub fn apply_failed_snapshot(&mut self, conversation: ConversationId) -> bool {
        if self.conversation != Some(conversation) {
            return false;
        }
        self.messages.clear();
        self.seen.clear();
        self.flush_buffered();
        true
    }

    pub fn push_live(&mut self, message: Message) -> LiveOutcome {
        if self.conversation != Some(message.conversation_id) {
            return LiveOutcome::Foreign;
        }
        if self.awaiting_snapshot {
            if self.buffered.iter().any(|held| held.id == message.id) {
                return LiveOutcome::Duplicate;
            }
            self.buffered.push(message);
            return LiveOutcome::Buffered;
        }
        if !self.seen.insert(message.id) {
            return LiveOutcome::Duplicate;
        }
        self.messages.push(message);
        LiveOutcome::Appended
    }

    fn flush_buffered(&mut self) {
        self.awaiting_snapshot = false;
        for message in std::mem::take(&mut self.buffered) {
            if self.seen.insert(message.id) {
                self.messages.push(message);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
