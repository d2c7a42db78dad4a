//! Cache-aside window of each chat's recent messages.
//!
//! The window lives in the backplane so every process in the cluster serves
//! history from the same copy.  Reads fall back to the store on a miss and
//! repopulate the cache; cache trouble of any kind degrades to direct store
//! reads without surfacing an error.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use rencontre_shared::{ChatId, MessagePayload};
use rencontre_store::Message;

use crate::backplane::{BackplaneGuard, ListEntry};
use crate::error::Result;
use crate::store_gateway::StoreGateway;

/// Per-chat bounded recent-message window with sliding expiration.
pub struct HistoryCache {
    backplane: Arc<BackplaneGuard>,
    store: StoreGateway,
    /// Maximum number of messages kept per chat.
    cap: usize,
    ttl: Duration,
}

impl HistoryCache {
    pub fn new(
        backplane: Arc<BackplaneGuard>,
        store: StoreGateway,
        cap: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            backplane,
            store,
            cap: cap.max(1),
            ttl,
        }
    }

    fn key(chat: ChatId) -> String {
        format!("chat:{chat}:history")
    }

    /// Record a freshly accepted message in its chat's window.
    ///
    /// The backplane skips ids already present in the window as part of
    /// the push itself, so a retried send stays invisible here just as it
    /// does in the store, even when two copies arrive concurrently.
    pub async fn add(&self, message: &MessagePayload) {
        match serde_json::to_string(message) {
            Ok(json) => {
                let entry = ListEntry {
                    id: message.id.to_string(),
                    payload: json,
                };
                self.backplane
                    .list_push(&Self::key(message.chat_id), entry, self.cap, self.ttl)
                    .await;
            }
            Err(e) => debug!(message = %message.id, error = %e, "failed to serialize for cache"),
        }
    }

    /// A page of the chat's recent messages, newest first (1-based pages).
    ///
    /// Served from cache when the window is present; otherwise the most
    /// recent window is loaded from the store and written back.
    pub async fn history(
        &self,
        chat: ChatId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<MessagePayload>> {
        let key = Self::key(chat);

        if let Some(entries) = self.backplane.list_read(&key).await {
            let messages: Vec<MessagePayload> =
                entries.iter().filter_map(|entry| parse_entry(entry)).collect();
            return Ok(page_of(messages, page, page_size));
        }

        let window = self.store.recent_messages(chat, self.cap as u32, 0).await?;
        let messages: Vec<MessagePayload> = window.iter().map(payload_from_stored).collect();

        if !messages.is_empty() {
            let entries: Vec<ListEntry> = messages
                .iter()
                .filter_map(|m| {
                    serde_json::to_string(m).ok().map(|payload| ListEntry {
                        id: m.id.to_string(),
                        payload,
                    })
                })
                .collect();
            self.backplane.list_write(&key, entries, self.ttl).await;
        }

        Ok(page_of(messages, page, page_size))
    }
}

fn parse_entry(entry: &str) -> Option<MessagePayload> {
    match serde_json::from_str(entry) {
        Ok(message) => Some(message),
        Err(e) => {
            debug!(error = %e, "discarding malformed cache entry");
            None
        }
    }
}

fn page_of(messages: Vec<MessagePayload>, page: u32, page_size: u32) -> Vec<MessagePayload> {
    let page = page.max(1) as usize;
    let page_size = page_size.max(1) as usize;
    messages
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .collect()
}

/// Wire shape of a stored message.
pub(crate) fn payload_from_stored(message: &Message) -> MessagePayload {
    MessagePayload {
        id: message.id,
        chat_id: message.chat_id,
        sender_id: message.sender_id,
        text: message.text.clone(),
        sent_at: message.sent_at,
        status: message.status,
        kind: message.kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rencontre_shared::constants::{BACKPLANE_PROBE_TTL_SECS, HISTORY_TTL_SECS};
    use rencontre_shared::{DeliveryStatus, MessageId, MessageKind, UserId};
    use rencontre_store::Database;

    use crate::backplane::MemoryBackplane;

    fn cache(cap: usize) -> (HistoryCache, StoreGateway) {
        let store = StoreGateway::new(Database::open_in_memory().unwrap());
        let guard = Arc::new(BackplaneGuard::new(
            Arc::new(MemoryBackplane::new()),
            Duration::from_secs(BACKPLANE_PROBE_TTL_SECS),
        ));
        (
            HistoryCache::new(
                guard,
                store.clone(),
                cap,
                Duration::from_secs(HISTORY_TTL_SECS),
            ),
            store,
        )
    }

    fn payload(chat: ChatId, text: &str) -> MessagePayload {
        MessagePayload {
            id: MessageId::new(),
            chat_id: chat,
            sender_id: UserId::new(),
            text: text.to_string(),
            sent_at: Utc::now(),
            status: DeliveryStatus::Delivered,
            kind: MessageKind::Normal,
        }
    }

    #[tokio::test]
    async fn add_is_id_deduplicating() {
        let (cache, _store) = cache(10);
        let chat = ChatId::new();
        let message = payload(chat, "salut");

        cache.add(&message).await;
        cache.add(&message).await;

        let window = cache.history(chat, 1, 10).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].id, message.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_adds_of_one_id_cache_once() {
        let (cache, _store) = cache(10);
        let cache = Arc::new(cache);
        let chat = ChatId::new();

        // Two copies of one send racing in: same id, fresh server clocks.
        let original = payload(chat, "salut");
        let mut retry = original.clone();
        retry.sent_at = original.sent_at + chrono::Duration::milliseconds(3);

        let mut handles = Vec::new();
        for copy in [original.clone(), retry] {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.add(&copy).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let window = cache.history(chat, 1, 10).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].id, original.id);
    }

    #[tokio::test]
    async fn window_is_bounded_newest_first() {
        let (cache, _store) = cache(3);
        let chat = ChatId::new();

        for i in 1..=5 {
            cache.add(&payload(chat, &format!("m{i}"))).await;
        }

        let window = cache.history(chat, 1, 10).await.unwrap();
        let texts: Vec<&str> = window.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m5", "m4", "m3"]);
    }

    #[tokio::test]
    async fn miss_falls_back_to_store_and_repopulates() {
        let (cache, store) = cache(10);
        let chat = ChatId::new();

        // Seed the store directly; the cache knows nothing yet.
        let mut sent_at = Utc::now();
        for i in 1..=3 {
            let mut message = payload(chat, &format!("m{i}"));
            sent_at += chrono::Duration::milliseconds(10);
            message.sent_at = sent_at;
            store
                .insert_message(rencontre_store::Message {
                    id: message.id,
                    chat_id: message.chat_id,
                    sender_id: message.sender_id,
                    text: message.text.clone(),
                    sent_at: message.sent_at,
                    status: message.status,
                    kind: message.kind,
                })
                .await
                .unwrap();
        }

        let window = cache.history(chat, 1, 10).await.unwrap();
        let texts: Vec<&str> = window.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m3", "m2", "m1"]);

        // The second read must come from the cache: a store row added
        // behind the cache's back stays invisible.
        store
            .insert_message(rencontre_store::Message {
                id: MessageId::new(),
                chat_id: chat,
                sender_id: UserId::new(),
                text: "sneaked".to_string(),
                sent_at: Utc::now() + chrono::Duration::seconds(1),
                status: DeliveryStatus::Delivered,
                kind: MessageKind::Normal,
            })
            .await
            .unwrap();

        let cached = cache.history(chat, 1, 10).await.unwrap();
        assert_eq!(cached.len(), 3);
    }

    #[tokio::test]
    async fn empty_chat_has_empty_history() {
        let (cache, _store) = cache(10);
        let window = cache.history(ChatId::new(), 1, 10).await.unwrap();
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn pages_slice_the_window() {
        let (cache, _store) = cache(10);
        let chat = ChatId::new();
        for i in 1..=5 {
            cache.add(&payload(chat, &format!("m{i}"))).await;
        }

        let first = cache.history(chat, 1, 2).await.unwrap();
        let second = cache.history(chat, 2, 2).await.unwrap();
        let texts: Vec<&str> = first
            .iter()
            .chain(second.iter())
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(texts, vec!["m5", "m4", "m3", "m2"]);
    }
}
