//! CRUD operations for [`Message`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use rencontre_shared::{ChatId, DeliveryStatus, MessageId, MessageKind, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

impl Database {
    /// Insert a message.
    ///
    /// The row is keyed by the sender-chosen message id, so a retried send
    /// with the same id is silently ignored.  Returns `true` when a new row
    /// was actually written.
    pub fn insert_message(&self, message: &Message) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages (id, chat_id, sender_id, text, sent_at, status, kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                message.chat_id.to_string(),
                message.sender_id.to_string(),
                message.text,
                message.sent_at.to_rfc3339(),
                message.status.code(),
                message.kind.code(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Fetch a page of a chat's messages, newest first.
    pub fn get_messages_for_chat(
        &self,
        chat_id: ChatId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, chat_id, sender_id, text, sent_at, status, kind
             FROM messages
             WHERE chat_id = ?1
             ORDER BY sent_at DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(params![chat_id.to_string(), limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Fetch a single message by its id.
    pub fn get_message_by_id(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT id, chat_id, sender_id, text, sent_at, status, kind
                 FROM messages WHERE id = ?1",
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Apply a delivery-status transition to one message.
    ///
    /// Transitions are monotonic (pending -> delivered -> read); an update
    /// that would move the status backwards, or replay the current value, is
    /// ignored.  Returns `true` if the row changed.
    pub fn update_message_status(&self, id: MessageId, status: DeliveryStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
            params![id.to_string(), status.code()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let chat_id_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let text: String = row.get(3)?;
    let sent_str: String = row.get(4)?;
    let status_code: i64 = row.get(5)?;
    let kind_code: i64 = row.get(6)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let chat_id = Uuid::parse_str(&chat_id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sender_id = Uuid::parse_str(&sender_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let sent_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&sent_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let status = DeliveryStatus::from_code(status_code)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, status_code))?;
    let kind = MessageKind::from_code(kind_code)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, kind_code))?;

    Ok(Message {
        id: MessageId(id),
        chat_id: ChatId(chat_id),
        sender_id: UserId(sender_id),
        text,
        sent_at,
        status,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(chat_id: ChatId) -> Message {
        Message {
            id: MessageId::new(),
            chat_id,
            sender_id: UserId::new(),
            text: "bonjour".to_string(),
            sent_at: Utc::now(),
            status: DeliveryStatus::Delivered,
            kind: MessageKind::Normal,
        }
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        let message = sample(ChatId::new());

        assert!(db.insert_message(&message).unwrap());
        assert!(!db.insert_message(&message).unwrap());

        let stored = db
            .get_messages_for_chat(message.chat_id, 10, 0)
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], message);
    }

    #[test]
    fn status_never_moves_backwards() {
        let db = Database::open_in_memory().unwrap();
        let message = sample(ChatId::new());
        db.insert_message(&message).unwrap();

        assert!(db
            .update_message_status(message.id, DeliveryStatus::Read)
            .unwrap());
        // Replay and downgrade are both no-ops.
        assert!(!db
            .update_message_status(message.id, DeliveryStatus::Read)
            .unwrap());
        assert!(!db
            .update_message_status(message.id, DeliveryStatus::Delivered)
            .unwrap());

        let stored = db.get_message_by_id(message.id).unwrap();
        assert_eq!(stored.status, DeliveryStatus::Read);
    }

    #[test]
    fn pages_are_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let chat_id = ChatId::new();

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut message = sample(chat_id);
            message.text = format!("message {i}");
            message.sent_at = Utc::now() + chrono::Duration::milliseconds(i);
            db.insert_message(&message).unwrap();
            ids.push(message.id);
        }

        let page = db.get_messages_for_chat(chat_id, 2, 0).unwrap();
        assert_eq!(page[0].id, ids[4]);
        assert_eq!(page[1].id, ids[3]);

        let next = db.get_messages_for_chat(chat_id, 2, 2).unwrap();
        assert_eq!(next[0].id, ids[2]);
    }
}
