//! Registry of live connections and the fan-out primitives over them.
//!
//! Every open socket registers one [`ConnectionHandle`] carrying its user,
//! the conversation it is currently viewing, and the outbound event channel
//! drained by the socket task.  Fan-out never blocks: senders are unbounded
//! and a send to a closing socket is simply counted as a miss. The socket
//! task's own disconnect path performs the authoritative cleanup so that
//! presence accounting stays consistent.

use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;

use rencontre_shared::{ChatId, ConnectionId, ConnectionSnapshot, ServerEvent, UserId};

/// One registered socket.
pub struct ConnectionHandle {
    pub user_id: UserId,
    /// The conversation this connection is currently viewing, if any.
    /// At most one; joining another conversation replaces it.
    pub joined_chat: Option<ChatId>,
    sender: mpsc::UnboundedSender<ServerEvent>,
    pub connected_at: Instant,
}

/// Shared registry of all live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a freshly accepted socket.
    pub fn register(
        &self,
        conn: ConnectionId,
        user: UserId,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) {
        self.connections.insert(
            conn,
            ConnectionHandle {
                user_id: user,
                joined_chat: None,
                sender,
                connected_at: Instant::now(),
            },
        );
    }

    /// Remove a connection, returning its owning user if it was registered.
    pub fn unregister(&self, conn: ConnectionId) -> Option<UserId> {
        self.connections
            .remove(&conn)
            .map(|(_, handle)| handle.user_id)
    }

    /// The user owning `conn`, if registered.
    pub fn user_of(&self, conn: ConnectionId) -> Option<UserId> {
        self.connections.get(&conn).map(|h| h.user_id)
    }

    /// Point `conn` at `chat`, implicitly leaving any previous conversation.
    ///
    /// Returns the previously joined chat, if any.
    pub fn join(&self, conn: ConnectionId, chat: ChatId) -> Option<ChatId> {
        let mut handle = self.connections.get_mut(&conn)?;
        handle.joined_chat.replace(chat)
    }

    /// Clear `conn`'s current conversation if it matches `chat`.
    ///
    /// Returns `true` if the connection was actually viewing that chat.
    pub fn leave(&self, conn: ConnectionId, chat: ChatId) -> bool {
        match self.connections.get_mut(&conn) {
            Some(mut handle) if handle.joined_chat == Some(chat) => {
                handle.joined_chat = None;
                true
            }
            _ => false,
        }
    }

    /// Deliver an event to a single connection.
    ///
    /// Returns `false` if the connection is unknown or its socket task has
    /// already gone away.
    pub fn send_to_connection(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        match self.connections.get(&conn) {
            Some(handle) => handle.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver an event to every connection of `user`.
    ///
    /// Returns the number of sockets reached.
    pub fn send_to_user(&self, user: UserId, event: &ServerEvent) -> usize {
        let mut reached = 0;
        for handle in self.connections.iter() {
            if handle.user_id == user && handle.sender.send(event.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Deliver an event to every connection currently viewing `chat`,
    /// skipping connections owned by `exclude` (typically the sender).
    ///
    /// Returns the number of sockets reached.
    pub fn send_to_chat(
        &self,
        chat: ChatId,
        event: &ServerEvent,
        exclude: Option<UserId>,
    ) -> usize {
        let mut reached = 0;
        for handle in self.connections.iter() {
            if handle.joined_chat != Some(chat) {
                continue;
            }
            if Some(handle.user_id) == exclude {
                continue;
            }
            if handle.sender.send(event.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Deliver an event to every live connection.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let mut reached = 0;
        for handle in self.connections.iter() {
            if handle.sender.send(event.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Read-only view of every live connection for the status endpoint.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .iter()
            .map(|entry| ConnectionSnapshot {
                connection_id: *entry.key(),
                user_id: entry.user_id,
                age_secs: entry.connected_at.elapsed().as_secs(),
            })
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
