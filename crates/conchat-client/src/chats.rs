//! Conversation list state: ordering, unread counters and previews.
//!
//! Unread counts live in memory only; a restart rebuilds the list from the
//! store with every counter at zero.

use chrono::{DateTime, Utc};
use serde::Serialize;

use conchat_shared::constants::PREVIEW_CHARS;
use conchat_shared::types::{truncate_chars, ConversationRef};
use conchat_store::{Message, StoredConversation};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: ConversationRef,
    pub preview: Option<String>,
    pub unread: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ConversationSummary {
    fn empty(conversation: ConversationRef) -> Self {
        Self {
            conversation,
            preview: None,
            unread: 0,
            last_activity: None,
        }
    }
}

fn preview(content: &str) -> String {
    truncate_chars(content, PREVIEW_CHARS).to_string()
}

/// Conversations, most recently active first.
#[derive(Debug, Clone, Default)]
pub struct ConversationIndex {
    entries: Vec<ConversationSummary>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the store listing (already ordered by last append).
    pub fn from_stored(stored: Vec<StoredConversation>) -> Self {
        let entries = stored
            .into_iter()
            .map(|c| ConversationSummary {
                conversation: c.conversation,
                preview: c.last_message.as_ref().map(|m| preview(&m.content)),
                unread: 0,
                last_activity: Some(c.updated_at),
            })
            .collect();
        Self { entries }
    }

    fn position(&self, conversation: &ConversationRef) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| &e.conversation == conversation)
    }

    /// Make sure `conversation` is listed; new entries go last.
    pub fn ensure(&mut self, conversation: ConversationRef) {
        if self.position(&conversation).is_none() {
            self.entries.push(ConversationSummary::empty(conversation));
        }
    }

    /// Move the message's conversation to the top, cache its preview and
    /// optionally count it as unread.
    pub fn record_activity(&mut self, message: &Message, count_unread: bool) {
        let mut entry = match self.position(&message.conversation) {
            Some(idx) => self.entries.remove(idx),
            None => ConversationSummary::empty(message.conversation),
        };

        entry.preview = Some(preview(&message.content));
        entry.last_activity = Some(message.timestamp);
        if count_unread {
            entry.unread = entry.unread.saturating_add(1);
        }
        self.entries.insert(0, entry);
    }

    /// Reset the unread counter.  Returns `true` if it was non-zero.
    pub fn mark_read(&mut self, conversation: &ConversationRef) -> bool {
        match self.position(conversation) {
            Some(idx) if self.entries[idx].unread > 0 => {
                self.entries[idx].unread = 0;
                true
            }
            _ => false,
        }
    }

    pub fn unread(&self, conversation: &ConversationRef) -> u32 {
        self.position(conversation)
            .map_or(0, |idx| self.entries[idx].unread)
    }

    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conchat_shared::types::{GroupId, MessageId, MessageStatus, UserId};

    fn message(conversation: ConversationRef, content: &str) -> Message {
        Message::new(
            MessageId::new(),
            conversation,
            UserId::new(),
            content,
            Utc::now(),
            MessageStatus::Delivered,
        )
    }

    #[test]
    fn test_activity_promotes_and_counts() {
        let a = ConversationRef::direct(UserId::new());
        let b = ConversationRef::group(GroupId::new());
        let mut index = ConversationIndex::new();
        index.ensure(a);
        index.ensure(b);
        assert_eq!(index.summaries()[0].conversation, a);

        index.record_activity(&message(b, "hello"), true);
        index.record_activity(&message(b, "again"), true);

        assert_eq!(index.summaries()[0].conversation, b);
        assert_eq!(index.unread(&b), 2);
        assert_eq!(index.unread(&a), 0);
        assert_eq!(index.summaries()[0].preview.as_deref(), Some("again"));

        assert!(index.mark_read(&b));
        assert!(!index.mark_read(&b));
        assert!(index.summaries().iter().all(|s| s.unread == 0));
    }

    #[test]
    fn test_preview_is_bounded() {
        let a = ConversationRef::direct(UserId::new());
        let mut index = ConversationIndex::new();
        index.record_activity(&message(a, &"x".repeat(300)), false);

        let summary = &index.summaries()[0];
        assert_eq!(summary.preview.as_ref().map(|p| p.chars().count()), Some(48));
        assert_eq!(summary.unread, 0);
    }
}
