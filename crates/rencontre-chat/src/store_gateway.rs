//! Async facade over the synchronous SQLite store.
//!
//! `rusqlite` is synchronous, so every call is pushed through
//! `spawn_blocking` and serialized behind a mutex; the runtime's worker
//! threads never touch disk I/O directly.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task;

use rencontre_shared::{ChatId, DeliveryStatus, MessageId, UserId};
use rencontre_store::{Chat, Database, DialogQuestion, Message, StoreError};

use crate::error::{ChatError, Result};

/// Cloneable handle to the shared database.
#[derive(Clone)]
pub struct StoreGateway {
    db: Arc<Mutex<Database>>,
}

impl StoreGateway {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run one store call on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> std::result::Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        match task::spawn_blocking(move || f(&db.lock())).await {
            Ok(result) => result.map_err(ChatError::from),
            Err(e) => Err(ChatError::Internal(format!("store task failed: {e}"))),
        }
    }

    pub async fn insert_message(&self, message: Message) -> Result<bool> {
        self.run(move |db| db.insert_message(&message)).await
    }

    pub async fn get_message(&self, id: MessageId) -> Result<Message> {
        self.run(move |db| db.get_message_by_id(id)).await
    }

    pub async fn update_message_status(
        &self,
        id: MessageId,
        status: DeliveryStatus,
    ) -> Result<bool> {
        self.run(move |db| db.update_message_status(id, status))
            .await
    }

    /// A page of a chat's messages, newest first.
    pub async fn recent_messages(
        &self,
        chat: ChatId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        self.run(move |db| db.get_messages_for_chat(chat, limit, offset))
            .await
    }

    pub async fn get_or_create_chat_for_pair(&self, a: UserId, b: UserId) -> Result<Chat> {
        self.run(move |db| db.get_or_create_chat_for_pair(a, b))
            .await
    }

    pub async fn has_questions(&self, owner: UserId) -> Result<bool> {
        self.run(move |db| db.has_questions(owner)).await
    }

    pub async fn next_question_after(
        &self,
        owner: UserId,
        after: Option<u32>,
    ) -> Result<Option<DialogQuestion>> {
        self.run(move |db| db.next_question_after(owner, after))
            .await
    }

    pub async fn replace_questions(&self, owner: UserId, texts: Vec<String>) -> Result<()> {
        self.run(move |db| db.replace_questions(owner, &texts))
            .await
    }
}
