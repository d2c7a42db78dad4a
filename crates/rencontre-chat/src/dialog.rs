//! Automated dialog engine.
//!
//! Each (questioner, answerer) pair runs at most one dialog: an ordered
//! walk through the questioner's configured question list, advanced one
//! step per human reply from the answerer.  The engine decides *what* to
//! deliver; the hub owns the actual delivery so dialog traffic flows
//! through exactly the same pipeline, cache, and fan-out as human traffic.
//!
//! Advancing is serialized per pair through an async mutex around the
//! last-delivered position: concurrent replies race for the lock, the
//! winner advances one step, late arrivals see the updated position and
//! advance from there.  Other pairs are untouched.

use std::sync::Arc;

use dashmap::{DashMap, Entry};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rencontre_shared::{ChatId, UserId};

use crate::store_gateway::StoreGateway;

/// Closing system message delivered when a question list runs out.
pub const DIALOG_CLOSING_TEXT: &str = "The automated dialog has ended.";

/// Key of one dialog: (questioner, answerer).  Ordered, so the same two
/// users can in principle run one dialog in each direction.
type DialogKey = (UserId, UserId);

struct DialogState {
    chat_id: ChatId,
    /// Position of the last delivered question; `None` until the first one
    /// goes out.  The mutex is the per-pair advance lock.
    position: Mutex<Option<u32>>,
}

/// A delivery decision produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogStep {
    /// Deliver `text` as a bot question from `questioner` in `chat_id`.
    Question {
        chat_id: ChatId,
        questioner: UserId,
        text: String,
    },
    /// The list is exhausted: deliver the closing system message.
    Closing { chat_id: ChatId, questioner: UserId },
}

/// An explicitly stopped dialog, reported so the hub can notify the
/// answerer.
pub struct StoppedDialog {
    pub chat_id: ChatId,
    pub answerer: UserId,
}

/// Per-pair dialog state machines.
pub struct DialogEngine {
    store: StoreGateway,
    dialogs: DashMap<DialogKey, Arc<DialogState>>,
    /// Secondary index for the send path: which dialog owns a chat.
    by_chat: DashMap<ChatId, DialogKey>,
}

impl DialogEngine {
    pub fn new(store: StoreGateway) -> Self {
        Self {
            store,
            dialogs: DashMap::new(),
            by_chat: DashMap::new(),
        }
    }

    /// Whether `sender` is the answerer of an active dialog in `chat`.
    ///
    /// The send path uses this to tag replies as bot answers without a
    /// store lookup.
    pub fn is_answer(&self, chat: ChatId, sender: UserId) -> bool {
        self.by_chat
            .get(&chat)
            .map(|key| key.1 == sender)
            .unwrap_or(false)
    }

    /// Number of active dialogs.
    pub fn active(&self) -> usize {
        self.dialogs.len()
    }

    /// Start a dialog from `questioner` towards `answerer`.
    ///
    /// A no-op when one is already running for the pair or when the
    /// questioner has no question list.  The first question is delivered
    /// immediately only if the answerer is online; otherwise the dialog
    /// sits idle until the answerer's first reply in the chat.
    pub async fn start(
        &self,
        questioner: UserId,
        answerer: UserId,
        answerer_online: bool,
    ) -> Option<DialogStep> {
        let key = (questioner, answerer);
        if self.dialogs.contains_key(&key) {
            debug!(questioner = %questioner, answerer = %answerer, "dialog already active");
            return None;
        }

        match self.store.has_questions(questioner).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(questioner = %questioner, "no dialog questions configured");
                return None;
            }
            Err(e) => {
                warn!(questioner = %questioner, error = %e, "question lookup failed");
                return None;
            }
        }

        let chat = match self
            .store
            .get_or_create_chat_for_pair(questioner, answerer)
            .await
        {
            Ok(chat) => chat,
            Err(e) => {
                warn!(questioner = %questioner, error = %e, "dialog chat creation failed");
                return None;
            }
        };

        let state = Arc::new(DialogState {
            chat_id: chat.id,
            position: Mutex::new(None),
        });

        // The vacant-entry claim decides races between concurrent starts.
        match self.dialogs.entry(key) {
            Entry::Occupied(_) => {
                debug!(questioner = %questioner, answerer = %answerer, "dialog already active");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
            }
        }
        self.by_chat.insert(chat.id, key);
        debug!(questioner = %questioner, answerer = %answerer, chat = %chat.id, "dialog started");

        if !answerer_online {
            debug!(answerer = %answerer, "answerer offline, first question deferred");
            return None;
        }

        self.advance(key, &state, answerer_online).await
    }

    /// React to a message sent in `chat`: if it is an answerer's reply to
    /// an active dialog, advance one step.
    pub async fn advance_after_reply(
        &self,
        chat: ChatId,
        sender: UserId,
        answerer_online: bool,
    ) -> Option<DialogStep> {
        let key = *self.by_chat.get(&chat)?.value();
        if key.1 != sender {
            return None;
        }
        let state = self.dialogs.get(&key).map(|entry| entry.value().clone())?;
        self.advance(key, &state, answerer_online).await
    }

    /// One locked advance step.
    async fn advance(
        &self,
        key: DialogKey,
        state: &Arc<DialogState>,
        answerer_online: bool,
    ) -> Option<DialogStep> {
        let mut position = state.position.lock().await;

        // Re-validate under the lock: the dialog may have been stopped,
        // torn down, or replaced while we waited.  A lost race is a no-op.
        match self.dialogs.get(&key) {
            Some(entry) if Arc::ptr_eq(entry.value(), state) => {}
            _ => return None,
        }
        if !answerer_online {
            debug!(answerer = %key.1, "answerer offline, dialog paused");
            return None;
        }

        match self.store.next_question_after(key.0, *position).await {
            Ok(Some(question)) => {
                *position = Some(question.position);
                debug!(
                    questioner = %key.0,
                    answerer = %key.1,
                    position = question.position,
                    "delivering dialog question"
                );
                Some(DialogStep::Question {
                    chat_id: state.chat_id,
                    questioner: key.0,
                    text: question.text,
                })
            }
            Ok(None) => {
                // Removed while the advance lock is still held: the next
                // waiter must find the dialog gone, not close it again.
                self.remove(key);
                debug!(questioner = %key.0, answerer = %key.1, "dialog exhausted");
                Some(DialogStep::Closing {
                    chat_id: state.chat_id,
                    questioner: key.0,
                })
            }
            Err(e) => {
                warn!(questioner = %key.0, error = %e, "question fetch failed, dialog not advanced");
                None
            }
        }
    }

    /// Stop the pair's dialog if one is running.
    pub fn stop(&self, questioner: UserId, answerer: UserId) -> Option<StoppedDialog> {
        let (_, state) = self.dialogs.remove(&(questioner, answerer))?;
        self.by_chat.remove(&state.chat_id);
        debug!(questioner = %questioner, answerer = %answerer, "dialog stopped");
        Some(StoppedDialog {
            chat_id: state.chat_id,
            answerer,
        })
    }

    /// Drop every dialog involving `user`, silently.  Called when the user
    /// goes fully offline.
    pub fn remove_user(&self, user: UserId) -> usize {
        let mut removed = 0;
        self.dialogs.retain(|key, state| {
            let involved = key.0 == user || key.1 == user;
            if involved {
                self.by_chat.remove(&state.chat_id);
                removed += 1;
            }
            !involved
        });
        removed
    }

    fn remove(&self, key: DialogKey) {
        if let Some((_, state)) = self.dialogs.remove(&key) {
            self.by_chat.remove(&state.chat_id);
        }
    }
}
