//! Wire protocol for the persistent chat session.
//!
//! Every frame is a JSON object. Client -> server frames carry an `"op"`
//! tag, server -> client frames an `"event"` tag:
//!
//! ```json
//! {"op": "send_message", "chat_id": "…", "client_message_id": "…", "text": "hi"}
//! {"event": "message_status", "client_message_id": "…", "message_id": "…", "status": "delivered"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChatId, ConnectionId, DeliveryStatus, MessageId, MessageKind, UserId};

/// Operations a client may invoke over its session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Join a conversation: subsequent broadcasts for this chat reach this
    /// connection, and recent history is replayed to it.
    JoinConversation { chat_id: ChatId },

    /// Leave the conversation (no-op if the connection is not in it).
    LeaveConversation { chat_id: ChatId },

    /// Send a chat message. `client_message_id` is a caller-generated UUID
    /// used as the idempotency key.
    SendMessage {
        chat_id: ChatId,
        client_message_id: String,
        text: String,
    },

    /// Mark a message as read on behalf of the recipient.
    MarkRead {
        chat_id: ChatId,
        message_id: MessageId,
    },

    /// Ask whether a single user is currently online.
    GetOnlineStatus { user_id: UserId },

    /// Ask for the set of currently-online users.
    ListOnlineUsers,

    /// Start the automated dialog against `responder`, using the question
    /// list owned by the calling user.
    StartBotDialog { responder: UserId },

    /// Stop the automated dialog against `responder`.
    StopBotDialog { responder: UserId },
}

/// Events the server pushes to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A new message in a chat this connection has joined.
    ReceiveMessage { message: MessagePayload },

    /// Acknowledgement to the sender: carries both the id the client chose
    /// and the canonical id the server recorded, so optimistic UI state can
    /// be reconciled.
    MessageStatus {
        client_message_id: String,
        message_id: MessageId,
        status: DeliveryStatus,
    },

    /// Read receipt pushed to the original sender of a message.
    StatusUpdate {
        chat_id: ChatId,
        message_id: MessageId,
        status: DeliveryStatus,
    },

    /// A user went online or offline.
    UserStatusChanged { user_id: UserId, online: bool },

    /// The automated dialog run by `questioner` has been stopped.
    BotDialogEnded { questioner: UserId },

    /// Reply to [`ClientCommand::GetOnlineStatus`].
    OnlineStatus { user_id: UserId, online: bool },

    /// Reply to [`ClientCommand::ListOnlineUsers`].
    OnlineUsers { users: Vec<UserId> },

    /// Synchronous rejection of the previous command (validation failure).
    Error { message: String },
}

/// A message as it travels over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePayload {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub kind: MessageKind,
}

/// One live connection as reported by the read-only status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    /// Seconds since the socket was accepted.
    pub age_secs: u64,
}
