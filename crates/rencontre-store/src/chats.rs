//! CRUD operations for [`Chat`] records.
//!
//! A chat is the single conversation between an unordered pair of users.
//! The pair is stored in canonical order and guarded by a UNIQUE index, so
//! "get or create" can never mint a second chat for the same two people.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use rencontre_shared::{ChatId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Chat;

impl Database {
    /// Fetch the chat between `a` and `b`, creating it on first contact.
    ///
    /// The argument order does not matter.
    pub fn get_or_create_chat_for_pair(&self, a: UserId, b: UserId) -> Result<Chat> {
        let (lo, hi) = canonical_pair(a, b);

        if let Some(existing) = self.chat_for_pair(lo, hi)? {
            return Ok(existing);
        }

        // INSERT OR IGNORE + re-select covers a concurrent creator.
        self.conn().execute(
            "INSERT OR IGNORE INTO chats (id, user_lo, user_hi, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                ChatId::new().to_string(),
                lo.to_string(),
                hi.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        self.chat_for_pair(lo, hi)?.ok_or(StoreError::NotFound)
    }

    /// Fetch a single chat by UUID.
    pub fn get_chat(&self, id: ChatId) -> Result<Chat> {
        self.conn()
            .query_row(
                "SELECT id, user_lo, user_hi, created_at
                 FROM chats
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_chat,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    fn chat_for_pair(&self, lo: UserId, hi: UserId) -> Result<Option<Chat>> {
        let chat = self
            .conn()
            .query_row(
                "SELECT id, user_lo, user_hi, created_at
                 FROM chats
                 WHERE user_lo = ?1 AND user_hi = ?2",
                params![lo.to_string(), hi.to_string()],
                row_to_chat,
            )
            .optional()?;
        Ok(chat)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Order a participant pair canonically (smaller UUID first).
fn canonical_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Map a `rusqlite::Row` to a [`Chat`].
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let id_str: String = row.get(0)?;
    let lo_str: String = row.get(1)?;
    let hi_str: String = row.get(2)?;
    let created_str: String = row.get(3)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let user_lo = Uuid::parse_str(&lo_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let user_hi = Uuid::parse_str(&hi_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Chat {
        id: ChatId(id),
        user_lo: UserId(user_lo),
        user_hi: UserId(user_hi),
        created_at,
    })
}
