//! Bounded per-conversation message logs.
//!
//! Each operation runs inside its own `IMMEDIATE` transaction so that the
//! read-check-write on a log is indivisible, and commits before returning.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use conchat_shared::constants::MAX_LOG_LEN;
use conchat_shared::types::{ConversationKind, ConversationRef, MessageId, MessageStatus};

use crate::database::Database;
use crate::error::Result;
use crate::models::{Message, StatusChange, StoredConversation};

impl Database {
    /// Ordered log for `conversation`, oldest first.  Empty if unknown.
    pub fn conversation_log(&self, conversation: &ConversationRef) -> Result<Vec<Message>> {
        load_log(self.conn(), conversation)
    }

    /// Append `message` to its conversation log.
    ///
    /// Returns `false` without writing when a message with the same id is
    /// already present.  Overflow beyond the retention bound is evicted in
    /// the same transaction.
    pub fn append_message(&self, message: &Message) -> Result<bool> {
        let tx = self.begin()?;
        let mut log = load_log(&tx, &message.conversation)?;

        if log.iter().any(|m| m.id == message.id) {
            debug!(
                msg_id = %message.id,
                conversation = %message.conversation,
                "Message already present, skipping append"
            );
            return Ok(false);
        }

        log.push(message.clone());
        let evicted = trim_to_retention(&mut log);
        save_log(&tx, &message.conversation, &log, true)?;
        tx.commit()?;

        if evicted > 0 {
            debug!(conversation = %message.conversation, evicted, "Evicted oldest messages");
        }
        Ok(true)
    }

    /// Overwrite the status of one message.  Returns `false` if not found.
    pub fn update_message_status(
        &self,
        conversation: &ConversationRef,
        message_id: MessageId,
        status: MessageStatus,
    ) -> Result<bool> {
        let tx = self.begin()?;
        let mut log = load_log(&tx, conversation)?;

        let Some(message) = log.iter_mut().find(|m| m.id == message_id) else {
            return Ok(false);
        };
        message.status = status;

        save_log(&tx, conversation, &log, false)?;
        tx.commit()?;
        Ok(true)
    }

    /// Move one message's status forward.  Backward transitions are
    /// rejected without writing.
    pub fn advance_message_status(
        &self,
        conversation: &ConversationRef,
        message_id: MessageId,
        next: MessageStatus,
    ) -> Result<StatusChange> {
        let tx = self.begin()?;
        let mut log = load_log(&tx, conversation)?;

        let Some(message) = log.iter_mut().find(|m| m.id == message_id) else {
            return Ok(StatusChange::NotFound);
        };

        let current = message.status;
        if !current.can_advance_to(next) {
            return Ok(StatusChange::Rejected { current });
        }
        message.status = next;

        save_log(&tx, conversation, &log, false)?;
        tx.commit()?;
        Ok(StatusChange::Applied { from: current })
    }

    /// Drop the oldest entries beyond the retention bound.  Returns how many
    /// were evicted.
    pub fn evict_overflow(&self, conversation: &ConversationRef) -> Result<usize> {
        let tx = self.begin()?;
        let mut log = load_log(&tx, conversation)?;

        let evicted = trim_to_retention(&mut log);
        if evicted > 0 {
            save_log(&tx, conversation, &log, false)?;
            tx.commit()?;
        }
        Ok(evicted)
    }

    /// All stored conversations, most recently appended first.
    pub fn conversations(&self) -> Result<Vec<StoredConversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT kind, conversation_id, messages, updated_at
             FROM conversation_logs
             ORDER BY updated_at DESC",
        )?;

        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            if let Some(conversation) = row? {
                conversations.push(conversation);
            }
        }
        Ok(conversations)
    }

    fn begin(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            self.conn(),
            TransactionBehavior::Immediate,
        )?)
    }
}

fn trim_to_retention(log: &mut Vec<Message>) -> usize {
    let overflow = log.len().saturating_sub(MAX_LOG_LEN);
    if overflow > 0 {
        log.drain(..overflow);
    }
    overflow
}

fn load_log(conn: &Connection, conversation: &ConversationRef) -> Result<Vec<Message>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT messages FROM conversation_logs WHERE log_key = ?1",
            params![conversation.storage_key()],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Vec::new()),
    }
}

fn save_log(
    conn: &Connection,
    conversation: &ConversationRef,
    log: &[Message],
    touch: bool,
) -> Result<()> {
    let json = serde_json::to_string(log)?;

    if touch {
        conn.execute(
            "INSERT INTO conversation_logs (log_key, kind, conversation_id, messages, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(log_key) DO UPDATE SET
                 messages = excluded.messages,
                 updated_at = excluded.updated_at",
            params![
                conversation.storage_key(),
                conversation.kind.as_str(),
                conversation.id.to_string(),
                json,
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;
    } else {
        conn.execute(
            "UPDATE conversation_logs SET messages = ?2 WHERE log_key = ?1",
            params![conversation.storage_key(), json],
        )?;
    }
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<StoredConversation>> {
    let kind_str: String = row.get(0)?;
    let id_str: String = row.get(1)?;
    let json: String = row.get(2)?;
    let ts_str: String = row.get(3)?;

    let Some(kind) = ConversationKind::from_str_opt(&kind_str) else {
        tracing::warn!(kind = %kind_str, "Skipping log with unknown conversation kind");
        return Ok(None);
    };

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let messages: Vec<Message> = serde_json::from_str(&json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Some(StoredConversation {
        conversation: ConversationRef { kind, id },
        message_count: messages.len(),
        last_message: messages.last().cloned(),
        updated_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conchat_shared::types::{GroupId, UserId};

    fn message(conversation: ConversationRef, status: MessageStatus) -> Message {
        Message::new(
            MessageId::new(),
            conversation,
            UserId::new(),
            "hello",
            Utc::now(),
            status,
        )
    }

    #[test]
    fn append_is_idempotent_per_id() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationRef::direct(UserId::new());
        let msg = message(conv, MessageStatus::Delivered);

        assert!(db.append_message(&msg).unwrap());
        assert!(!db.append_message(&msg).unwrap());
        assert_eq!(db.conversation_log(&conv).unwrap().len(), 1);
    }

    #[test]
    fn same_id_in_different_conversations_is_not_a_duplicate() {
        let db = Database::open_in_memory().unwrap();
        let a = ConversationRef::direct(UserId::new());
        let b = ConversationRef::group(GroupId::new());

        let msg = message(a, MessageStatus::Delivered);
        let mut copy = msg.clone();
        copy.conversation = b;

        assert!(db.append_message(&msg).unwrap());
        assert!(db.append_message(&copy).unwrap());
        assert_eq!(db.conversation_log(&a).unwrap().len(), 1);
        assert_eq!(db.conversation_log(&b).unwrap().len(), 1);
    }

    #[test]
    fn retention_keeps_newest_five_hundred() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationRef::group(GroupId::new());

        let mut ids = Vec::new();
        for _ in 0..600 {
            let msg = message(conv, MessageStatus::Delivered);
            ids.push(msg.id);
            assert!(db.append_message(&msg).unwrap());
        }

        let log = db.conversation_log(&conv).unwrap();
        assert_eq!(log.len(), MAX_LOG_LEN);
        let kept: Vec<MessageId> = log.iter().map(|m| m.id).collect();
        assert_eq!(kept, ids[100..]);
    }

    #[test]
    fn evict_overflow_on_small_log_is_noop() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationRef::direct(UserId::new());
        db.append_message(&message(conv, MessageStatus::Sent)).unwrap();

        assert_eq!(db.evict_overflow(&conv).unwrap(), 0);
        assert_eq!(db.evict_overflow(&ConversationRef::direct(UserId::new())).unwrap(), 0);
    }

    #[test]
    fn update_status_reports_missing_ids() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationRef::direct(UserId::new());
        let msg = message(conv, MessageStatus::Sending);
        db.append_message(&msg).unwrap();

        assert!(db
            .update_message_status(&conv, msg.id, MessageStatus::Sent)
            .unwrap());
        assert!(!db
            .update_message_status(&conv, MessageId::new(), MessageStatus::Sent)
            .unwrap());
        assert_eq!(
            db.conversation_log(&conv).unwrap()[0].status,
            MessageStatus::Sent
        );
    }

    #[test]
    fn advance_status_is_monotonic() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationRef::direct(UserId::new());
        let msg = message(conv, MessageStatus::Sending);
        db.append_message(&msg).unwrap();

        assert_eq!(
            db.advance_message_status(&conv, msg.id, MessageStatus::Delivered)
                .unwrap(),
            StatusChange::Applied {
                from: MessageStatus::Sending
            }
        );
        assert_eq!(
            db.advance_message_status(&conv, msg.id, MessageStatus::Sent)
                .unwrap(),
            StatusChange::Rejected {
                current: MessageStatus::Delivered
            }
        );
        assert_eq!(
            db.advance_message_status(&conv, MessageId::new(), MessageStatus::Read)
                .unwrap(),
            StatusChange::NotFound
        );
        assert_eq!(
            db.conversation_log(&conv).unwrap()[0].status,
            MessageStatus::Delivered
        );
    }

    #[test]
    fn logs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conchat.db");
        let conv = ConversationRef::group(GroupId::new());
        let msg = message(conv, MessageStatus::Sending);

        {
            let db = Database::open_at(&path).unwrap();
            db.append_message(&msg).unwrap();
            db.advance_message_status(&conv, msg.id, MessageStatus::Failed)
                .unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let log = db.conversation_log(&conv).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, msg.id);
        assert_eq!(log[0].status, MessageStatus::Failed);
    }

    #[test]
    fn conversations_are_listed_most_recent_first() {
        let db = Database::open_in_memory().unwrap();
        let older = ConversationRef::direct(UserId::new());
        let newer = ConversationRef::group(GroupId::new());

        db.append_message(&message(older, MessageStatus::Delivered))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let last = message(newer, MessageStatus::Delivered);
        db.append_message(&last).unwrap();

        let listed = db.conversations().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].conversation, newer);
        assert_eq!(listed[0].last_message.as_ref().map(|m| m.id), Some(last.id));
        assert_eq!(listed[1].conversation, older);
        assert_eq!(listed[1].message_count, 1);
    }
}
