//! CRUD operations for the per-user automated-dialog question lists.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use rencontre_shared::UserId;

use crate::database::Database;
use crate::error::Result;
use crate::models::DialogQuestion;

impl Database {
    /// Replace `owner`'s question list with `texts`, positions 1..=len.
    pub fn replace_questions(&self, owner: UserId, texts: &[String]) -> Result<()> {
        self.conn().execute(
            "DELETE FROM dialog_questions WHERE owner_id = ?1",
            params![owner.to_string()],
        )?;

        for (i, text) in texts.iter().enumerate() {
            self.conn().execute(
                "INSERT INTO dialog_questions (id, owner_id, position, text)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    owner.to_string(),
                    (i + 1) as i64,
                    text,
                ],
            )?;
        }
        Ok(())
    }

    /// Whether `owner` has any questions configured at all.
    pub fn has_questions(&self, owner: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM dialog_questions WHERE owner_id = ?1",
            params![owner.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The first question with a position strictly greater than `after`
    /// (`None` = start of the list).  `Ok(None)` means the list is
    /// exhausted.
    pub fn next_question_after(
        &self,
        owner: UserId,
        after: Option<u32>,
    ) -> Result<Option<DialogQuestion>> {
        let floor = after.map(i64::from).unwrap_or(0);

        let question = self
            .conn()
            .query_row(
                "SELECT id, owner_id, position, text
                 FROM dialog_questions
                 WHERE owner_id = ?1 AND position > ?2
                 ORDER BY position ASC
                 LIMIT 1",
                params![owner.to_string(), floor],
                row_to_question,
            )
            .optional()?;
        Ok(question)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`DialogQuestion`].
fn row_to_question(row: &rusqlite::Row<'_>) -> rusqlite::Result<DialogQuestion> {
    let id_str: String = row.get(0)?;
    let owner_str: String = row.get(1)?;
    let position: i64 = row.get(2)?;
    let text: String = row.get(3)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let owner_id = Uuid::parse_str(&owner_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(DialogQuestion {
        id,
        owner_id: UserId(owner_id),
        position: position as u32,
        text,
    })
}
