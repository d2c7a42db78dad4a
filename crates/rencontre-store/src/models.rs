//! Domain model structs persisted in the chat database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the delivery layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rencontre_shared::{ChatId, DeliveryStatus, MessageId, MessageKind, UserId};

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A two-party conversation.
///
/// The participant pair is stored in canonical order (`user_lo <= user_hi`
/// by UUID byte order), which together with a UNIQUE index guarantees at
/// most one chat per unordered pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    /// Unique chat identifier.
    pub id: ChatId,
    /// Smaller participant UUID of the pair.
    pub user_lo: UserId,
    /// Larger participant UUID of the pair.
    pub user_hi: UserId,
    /// When the chat was first created.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Message identifier, chosen by the sender and doubling as the
    /// idempotency key for retried sends.
    pub id: MessageId,
    /// The chat this message belongs to.
    pub chat_id: ChatId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Plain message text.
    pub text: String,
    /// Server-side receive timestamp.
    pub sent_at: DateTime<Utc>,
    /// Delivery status (pending / delivered / read).
    pub status: DeliveryStatus,
    /// Message kind (normal / system / bot question / bot answer).
    pub kind: MessageKind,
}

// ---------------------------------------------------------------------------
// DialogQuestion
// ---------------------------------------------------------------------------

/// One entry of a user's ordered automated-dialog question list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DialogQuestion {
    /// Unique question identifier.
    pub id: Uuid,
    /// The user whose dialog this question belongs to.
    pub owner_id: UserId,
    /// 1-based position within the owner's list.
    pub position: u32,
    /// Question text delivered verbatim to the answerer.
    pub text: String,
}
