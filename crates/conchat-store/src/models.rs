//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize`: conversation logs are
//! stored as JSON arrays of [`Message`], and the same structs are handed to
//! the UI layer unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conchat_shared::constants::MAX_CONTENT_CHARS;
use conchat_shared::types::{truncate_chars, ConversationRef, MessageId, MessageStatus, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.  `status` is the only field that changes after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Client-generated identifier, unique within a conversation log.
    pub id: MessageId,
    /// The conversation this message belongs to.
    pub conversation: ConversationRef,
    /// Author of the message.
    pub sender: UserId,
    /// Text content, at most `MAX_CONTENT_CHARS` characters.
    pub content: String,
    /// When the message was sent (as reported by the sender).
    pub timestamp: DateTime<Utc>,
    /// Delivery status.
    pub status: MessageStatus,
}

impl Message {
    /// Build a message, truncating content that exceeds the size bound.
    pub fn new(
        id: MessageId,
        conversation: ConversationRef,
        sender: UserId,
        content: &str,
        timestamp: DateTime<Utc>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            conversation,
            sender,
            content: truncate_chars(content, MAX_CONTENT_CHARS).to_string(),
            timestamp,
            status,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation summaries
// ---------------------------------------------------------------------------

/// A conversation known to the store, as listed by
/// [`Database::conversations`](crate::Database::conversations).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredConversation {
    pub conversation: ConversationRef,
    /// Most recently appended message, if the log is non-empty.
    pub last_message: Option<Message>,
    /// Number of retained messages.
    pub message_count: usize,
    /// Time of the last append.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Status transitions
// ---------------------------------------------------------------------------

/// Outcome of [`Database::advance_message_status`](crate::Database::advance_message_status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The status moved forward from `from`.
    Applied { from: MessageStatus },
    /// The requested transition would move backwards; nothing was written.
    Rejected { current: MessageStatus },
    /// No message with that id exists in the conversation log.
    NotFound,
}
