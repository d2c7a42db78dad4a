//! The message distribution hub.
//!
//! [`ChatHub`] ties the engine together: it owns presence, the connection
//! registry, the ingestion pipeline, the history cache, the dialog engine,
//! and the backplane, and exposes the operations the socket layer drives.
//!
//! The send path runs in a fixed order: validate, classify against the
//! dialog engine, enqueue for durability, cache, fan out to local sockets,
//! replicate to sibling processes, ack the sender.  Live sockets hear about
//! a message before the store write completes, trading durability for
//! freshness on this path, while per-chat store order still follows
//! submission order through the single pipeline consumer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rencontre_shared::constants::{
    BACKPLANE_PROBE_TTL_SECS, DEFAULT_DRAIN_GRACE_SECS, DEFAULT_HISTORY_PAGE_SIZE,
    DEFAULT_QUEUE_CAPACITY, HISTORY_CACHE_CAP, HISTORY_TTL_SECS, MAX_MESSAGE_CHARS,
};
use rencontre_shared::{
    ChatId, ClientCommand, ConnectionId, ConnectionSnapshot, DeliveryStatus, MessageId,
    MessageKind, MessagePayload, ServerEvent, UserId,
};
use rencontre_store::Message;

use crate::backplane::{Backplane, BackplaneEvent, BackplaneEventKind, BackplaneGuard};
use crate::dialog::{DialogEngine, DialogStep, DIALOG_CLOSING_TEXT};
use crate::error::{ChatError, Result};
use crate::history::HistoryCache;
use crate::pipeline::IngestionPipeline;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::store_gateway::StoreGateway;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tunables for a hub instance.  Defaults mirror the protocol constants.
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub queue_capacity: usize,
    pub drain_grace: Duration,
    pub history_cap: usize,
    pub history_ttl: Duration,
    pub history_page_size: u32,
    pub probe_ttl: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_grace: Duration::from_secs(DEFAULT_DRAIN_GRACE_SECS),
            history_cap: HISTORY_CACHE_CAP,
            history_ttl: Duration::from_secs(HISTORY_TTL_SECS),
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            probe_ttl: Duration::from_secs(BACKPLANE_PROBE_TTL_SECS),
        }
    }
}

/// Read-only view of the hub for the status endpoint.
#[derive(Debug, serde::Serialize)]
pub struct HubStatus {
    pub connections: usize,
    pub online_users: usize,
    pub queued_messages: usize,
    pub active_dialogs: usize,
    pub backplane_reachable: bool,
    pub sockets: Vec<ConnectionSnapshot>,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct ChatHub {
    presence: Arc<PresenceTracker>,
    registry: Arc<ConnectionRegistry>,
    pipeline: IngestionPipeline,
    history: HistoryCache,
    dialog: DialogEngine,
    backplane: Arc<BackplaneGuard>,
    store: StoreGateway,
    /// Supervises read-receipt and replication tasks so shutdown can wait
    /// for them instead of dropping work on the floor.
    tracker: TaskTracker,
    shutdown: CancellationToken,
    /// Identifies this process on the backplane; own events are skipped.
    process_id: Uuid,
    history_page_size: u32,
}

impl ChatHub {
    /// Build the hub and spawn its background tasks (pipeline consumer and
    /// backplane listener).
    pub fn new(
        store: StoreGateway,
        backplane: Arc<dyn Backplane>,
        options: HubOptions,
    ) -> Arc<Self> {
        let guard = Arc::new(BackplaneGuard::new(backplane, options.probe_ttl));
        let pipeline =
            IngestionPipeline::start(store.clone(), options.queue_capacity, options.drain_grace);
        let history = HistoryCache::new(
            guard.clone(),
            store.clone(),
            options.history_cap,
            options.history_ttl,
        );

        // Subscribe before the hub is handed out so no sibling event
        // published after construction can slip past the listener.
        let events = guard.subscribe();

        let hub = Arc::new(Self {
            presence: Arc::new(PresenceTracker::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            pipeline,
            history,
            dialog: DialogEngine::new(store.clone()),
            backplane: guard,
            store,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            process_id: Uuid::new_v4(),
            history_page_size: options.history_page_size,
        });

        hub.tracker.spawn(listen_to_siblings(hub.clone(), events));
        hub
    }

    /// This process's identity on the backplane.
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Shared store handle, for seeding and diagnostics.
    pub fn store(&self) -> &StoreGateway {
        &self.store
    }

    // -----------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------

    /// Register a freshly accepted socket and account its user as present.
    pub fn connect(&self, user: UserId, sender: mpsc::UnboundedSender<ServerEvent>) -> ConnectionId {
        let conn = ConnectionId::new();
        self.registry.register(conn, user, sender);

        if self.presence.connect(user) {
            info!(user = %user, conn = %conn, "user online");
            self.push_presence(user, true);
        } else {
            debug!(user = %user, conn = %conn, "additional connection");
        }
        conn
    }

    /// Tear down a socket.  When it was the user's last one, presence flips
    /// to offline and every dialog involving the user is dropped.
    pub fn disconnect(&self, conn: ConnectionId) {
        let Some(user) = self.registry.unregister(conn) else {
            return;
        };

        if self.presence.disconnect(user) {
            info!(user = %user, conn = %conn, "user offline");
            let dropped = self.dialog.remove_user(user);
            if dropped > 0 {
                debug!(user = %user, dialogs = dropped, "dropped dialogs of offline user");
            }
            self.push_presence(user, false);
        }
    }

    fn push_presence(&self, user: UserId, online: bool) {
        let event = ServerEvent::UserStatusChanged { user_id: user, online };
        self.registry.broadcast_all(&event);
        self.publish(BackplaneEventKind::PresenceChanged { user_id: user, online });
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    /// Dispatch one client command.  Errors are validation failures the
    /// socket layer reports back on the same connection.
    pub async fn handle_command(&self, conn: ConnectionId, command: ClientCommand) -> Result<()> {
        match command {
            ClientCommand::JoinConversation { chat_id } => {
                self.join(conn, chat_id).await;
                Ok(())
            }
            ClientCommand::LeaveConversation { chat_id } => {
                self.leave(conn, chat_id);
                Ok(())
            }
            ClientCommand::SendMessage {
                chat_id,
                client_message_id,
                text,
            } => self.send(conn, chat_id, &client_message_id, &text).await,
            ClientCommand::MarkRead {
                chat_id,
                message_id,
            } => {
                self.mark_read(chat_id, message_id);
                Ok(())
            }
            ClientCommand::GetOnlineStatus { user_id } => {
                self.registry.send_to_connection(
                    conn,
                    ServerEvent::OnlineStatus {
                        user_id,
                        online: self.presence.is_online(user_id),
                    },
                );
                Ok(())
            }
            ClientCommand::ListOnlineUsers => {
                self.registry.send_to_connection(
                    conn,
                    ServerEvent::OnlineUsers {
                        users: self.presence.online_users(),
                    },
                );
                Ok(())
            }
            ClientCommand::StartBotDialog { responder } => {
                self.start_dialog(conn, responder).await;
                Ok(())
            }
            ClientCommand::StopBotDialog { responder } => {
                self.stop_dialog(conn, responder);
                Ok(())
            }
        }
    }

    /// Accept a message from `conn` into `chat`.
    ///
    /// Validation is all-or-nothing: a rejected message has no side
    /// effects.  On success the caller's ack is pushed onto its own
    /// connection after local fan-out, and any dialog addressed by the
    /// message advances afterwards.
    pub async fn send(
        &self,
        conn: ConnectionId,
        chat: ChatId,
        client_message_id: &str,
        text: &str,
    ) -> Result<()> {
        let id = MessageId::parse(client_message_id)
            .map_err(|_| ChatError::InvalidMessageId(client_message_id.to_string()))?;
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::MessageTooLong);
        }
        let sender = self
            .registry
            .user_of(conn)
            .ok_or(ChatError::UnknownConnection)?;

        let kind = if self.dialog.is_answer(chat, sender) {
            MessageKind::BotAnswer
        } else {
            MessageKind::Normal
        };

        let payload = MessagePayload {
            id,
            chat_id: chat,
            sender_id: sender,
            text: text.to_string(),
            sent_at: Utc::now(),
            status: DeliveryStatus::Delivered,
            kind,
        };
        self.deliver(&payload).await?;

        self.registry.send_to_connection(
            conn,
            ServerEvent::MessageStatus {
                client_message_id: client_message_id.to_string(),
                message_id: id,
                status: DeliveryStatus::Delivered,
            },
        );

        if kind == MessageKind::BotAnswer {
            let online = self.presence.is_online(sender);
            if let Some(step) = self.dialog.advance_after_reply(chat, sender, online).await {
                self.deliver_step(step).await;
            }
        }
        Ok(())
    }

    /// Point `conn` at `chat` and replay recent history to it, oldest
    /// first.  Any previously joined conversation is left implicitly.
    pub async fn join(&self, conn: ConnectionId, chat: ChatId) {
        if let Some(previous) = self.registry.join(conn, chat) {
            if previous != chat {
                debug!(conn = %conn, previous = %previous, "implicitly left previous chat");
            }
        }

        match self.history.history(chat, 1, self.history_page_size).await {
            Ok(window) => {
                // The cache is newest-first; replay in reading order.
                for message in window.into_iter().rev() {
                    self.registry
                        .send_to_connection(conn, ServerEvent::ReceiveMessage { message });
                }
            }
            Err(e) => {
                warn!(chat = %chat, error = %e, "history replay failed");
            }
        }
    }

    pub fn leave(&self, conn: ConnectionId, chat: ChatId) {
        if self.registry.leave(conn, chat) {
            debug!(conn = %conn, chat = %chat, "left chat");
        }
    }

    /// Record a read receipt.  Runs supervised in the background: the
    /// stored status flips to read, the original sender is notified on
    /// every local socket, and the receipt always replicates to siblings
    /// in case the sender is connected elsewhere.
    pub fn mark_read(&self, chat: ChatId, message_id: MessageId) {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let presence = self.presence.clone();
        let backplane = self.backplane.clone();
        let process_id = self.process_id;

        self.tracker.spawn(async move {
            match store.update_message_status(message_id, DeliveryStatus::Read).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(message = %message_id, "read receipt did not change stored status");
                }
                Err(e) => {
                    warn!(message = %message_id, error = %e, "failed to persist read status");
                }
            }

            let sender_id = match store.get_message(message_id).await {
                Ok(message) => message.sender_id,
                Err(e) => {
                    debug!(message = %message_id, error = %e, "read message lookup failed");
                    return;
                }
            };

            let event = ServerEvent::StatusUpdate {
                chat_id: chat,
                message_id,
                status: DeliveryStatus::Read,
            };
            if presence.is_online(sender_id) {
                registry.send_to_user(sender_id, &event);
            }
            backplane
                .publish(BackplaneEvent {
                    origin: process_id,
                    kind: BackplaneEventKind::ReadReceipt {
                        chat_id: chat,
                        message_id,
                        sender_id,
                    },
                })
                .await;
        });
    }

    /// Start the automated dialog owned by `conn`'s user towards
    /// `answerer`.
    pub async fn start_dialog(&self, conn: ConnectionId, answerer: UserId) {
        let Some(questioner) = self.registry.user_of(conn) else {
            return;
        };
        let online = self.presence.is_online(answerer);
        if let Some(step) = self.dialog.start(questioner, answerer, online).await {
            self.deliver_step(step).await;
        }
    }

    /// Stop the automated dialog towards `answerer` and tell them so.
    pub fn stop_dialog(&self, conn: ConnectionId, answerer: UserId) {
        let Some(questioner) = self.registry.user_of(conn) else {
            return;
        };
        if let Some(stopped) = self.dialog.stop(questioner, answerer) {
            let event = ServerEvent::BotDialogEnded { questioner };
            self.registry.send_to_user(stopped.answerer, &event);
            self.publish(BackplaneEventKind::DialogEnded {
                questioner,
                answerer: stopped.answerer,
            });
        }
    }

    // -----------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------

    /// The shared delivery path for human and dialog messages alike.
    async fn deliver(&self, payload: &MessagePayload) -> Result<()> {
        self.pipeline.enqueue(Message {
            id: payload.id,
            chat_id: payload.chat_id,
            sender_id: payload.sender_id,
            text: payload.text.clone(),
            sent_at: payload.sent_at,
            status: payload.status,
            kind: payload.kind,
        })?;
        self.history.add(payload).await;

        let event = ServerEvent::ReceiveMessage {
            message: payload.clone(),
        };
        let reached = self
            .registry
            .send_to_chat(payload.chat_id, &event, Some(payload.sender_id));
        debug!(
            chat = %payload.chat_id,
            message = %payload.id,
            sockets = reached,
            "message fanned out"
        );

        self.publish(BackplaneEventKind::MessageBroadcast {
            chat_id: payload.chat_id,
            message: payload.clone(),
        });
        Ok(())
    }

    /// Deliver a dialog step as a regular message from the questioner.
    async fn deliver_step(&self, step: DialogStep) {
        let (chat_id, questioner, text, kind) = match step {
            DialogStep::Question {
                chat_id,
                questioner,
                text,
            } => (chat_id, questioner, text, MessageKind::BotQuestion),
            DialogStep::Closing { chat_id, questioner } => (
                chat_id,
                questioner,
                DIALOG_CLOSING_TEXT.to_string(),
                MessageKind::System,
            ),
        };

        let payload = MessagePayload {
            id: MessageId::new(),
            chat_id,
            sender_id: questioner,
            text,
            sent_at: Utc::now(),
            status: DeliveryStatus::Delivered,
            kind,
        };
        if let Err(e) = self.deliver(&payload).await {
            warn!(chat = %chat_id, error = %e, "failed to deliver dialog step");
        }
    }

    /// Replicate an event to sibling processes without blocking the caller.
    fn publish(&self, kind: BackplaneEventKind) {
        let event = BackplaneEvent {
            origin: self.process_id,
            kind,
        };
        let backplane = self.backplane.clone();
        self.tracker.spawn(async move {
            backplane.publish(event).await;
        });
    }

    // -----------------------------------------------------------------
    // Introspection & shutdown
    // -----------------------------------------------------------------

    pub fn status(&self) -> HubStatus {
        HubStatus {
            connections: self.registry.len(),
            online_users: self.presence.online_count(),
            queued_messages: self.pipeline.backlog(),
            active_dialogs: self.dialog.active(),
            backplane_reachable: self.backplane.reachable_cached(),
            sockets: self.registry.snapshot(),
        }
    }

    /// Graceful shutdown: stop listening to siblings, drain the pipeline
    /// within its grace period, then wait for supervised tasks.
    pub async fn shutdown(&self) {
        info!("chat hub shutting down");
        self.shutdown.cancel();
        self.pipeline.shutdown().await;
        self.tracker.close();
        self.tracker.wait().await;
    }
}

// ---------------------------------------------------------------------------
// Backplane listener
// ---------------------------------------------------------------------------

/// Apply events published by sibling processes to local connections.
async fn listen_to_siblings(
    hub: Arc<ChatHub>,
    mut events: tokio::sync::broadcast::Receiver<BackplaneEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = hub.shutdown.cancelled() => {
                debug!("backplane listener stopped");
                return;
            }
            received = events.recv() => match received {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "backplane listener lagging, events skipped");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("backplane event stream closed");
                    return;
                }
            },
        };

        if event.origin == hub.process_id {
            continue;
        }

        match event.kind {
            BackplaneEventKind::MessageBroadcast { chat_id, message } => {
                let sender = message.sender_id;
                let event = ServerEvent::ReceiveMessage { message };
                hub.registry.send_to_chat(chat_id, &event, Some(sender));
            }
            BackplaneEventKind::ReadReceipt {
                chat_id,
                message_id,
                sender_id,
            } => {
                let event = ServerEvent::StatusUpdate {
                    chat_id,
                    message_id,
                    status: DeliveryStatus::Read,
                };
                hub.registry.send_to_user(sender_id, &event);
            }
            BackplaneEventKind::PresenceChanged { user_id, online } => {
                hub.registry
                    .broadcast_all(&ServerEvent::UserStatusChanged { user_id, online });
            }
            BackplaneEventKind::DialogEnded {
                questioner,
                answerer,
            } => {
                hub.registry
                    .send_to_user(answerer, &ServerEvent::BotDialogEnded { questioner });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::backplane::MemoryBackplane;
    use rencontre_store::Database;

    async fn test_hub() -> Arc<ChatHub> {
        hub_on(Arc::new(MemoryBackplane::new())).await
    }

    async fn hub_on(backplane: Arc<MemoryBackplane>) -> Arc<ChatHub> {
        let store = StoreGateway::new(Database::open_in_memory().unwrap());
        ChatHub::new(store, backplane, HubOptions::default())
    }

    fn client(
        hub: &ChatHub,
        user: UserId,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (hub.connect(user, tx), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Drain until an event matching `pred` arrives.
    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<ServerEvent>, mut pred: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Discard everything already queued, presence chatter mostly.
    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) {
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn send_acks_sender_and_reaches_the_counterpart() {
        let hub = test_hub().await;
        let alice = UserId::new();
        let bob = UserId::new();
        let chat = ChatId::new();

        let (alice_conn, mut alice_rx) = client(&hub, alice);
        let (bob_conn, mut bob_rx) = client(&hub, bob);
        hub.join(alice_conn, chat).await;
        hub.join(bob_conn, chat).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        // Empty chat: the joins replayed nothing.
        assert!(bob_rx.try_recv().is_err());

        let client_id = MessageId::new().to_string();
        hub.send(alice_conn, chat, &client_id, "bonjour").await.unwrap();

        let ack = wait_for(&mut alice_rx, |e| {
            matches!(e, ServerEvent::MessageStatus { .. })
        })
        .await;
        let canonical = match ack {
            ServerEvent::MessageStatus {
                client_message_id,
                message_id,
                status,
            } => {
                assert_eq!(client_message_id, client_id);
                assert_eq!(status, DeliveryStatus::Delivered);
                message_id
            }
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(canonical.to_string(), client_id);

        let received = wait_for(&mut bob_rx, |e| {
            matches!(e, ServerEvent::ReceiveMessage { .. })
        })
        .await;
        match received {
            ServerEvent::ReceiveMessage { message } => {
                assert_eq!(message.id, canonical);
                assert_eq!(message.text, "bonjour");
                assert_eq!(message.kind, MessageKind::Normal);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sender_never_hears_its_own_message() {
        let hub = test_hub().await;
        let alice = UserId::new();
        let chat = ChatId::new();

        let (conn_a, mut rx_a) = client(&hub, alice);
        let (conn_b, mut rx_b) = client(&hub, alice);
        hub.join(conn_a, chat).await;
        hub.join(conn_b, chat).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.send(conn_a, chat, &MessageId::new().to_string(), "note to self")
            .await
            .unwrap();

        // The ack lands on the sending socket only; neither of the user's
        // sockets receives the broadcast.
        let ack = next_event(&mut rx_a).await;
        assert!(matches!(ack, ServerEvent::MessageStatus { .. }));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn validation_rejects_without_side_effects() {
        let hub = test_hub().await;
        let alice = UserId::new();
        let chat = ChatId::new();
        let (conn, mut rx) = client(&hub, alice);
        hub.join(conn, chat).await;
        drain(&mut rx);

        assert!(matches!(
            hub.send(conn, chat, "not-a-uuid", "hi").await,
            Err(ChatError::InvalidMessageId(_))
        ));
        assert!(matches!(
            hub.send(conn, chat, &MessageId::new().to_string(), "   ").await,
            Err(ChatError::EmptyMessage)
        ));
        let oversized = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(
            hub.send(conn, chat, &MessageId::new().to_string(), &oversized)
                .await,
            Err(ChatError::MessageTooLong)
        ));

        // Nothing was queued, cached, or delivered.
        assert_eq!(hub.status().queued_messages, 0);
        assert!(hub.history.history(chat, 1, 10).await.unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_send_persists_once() {
        let hub = test_hub().await;
        let alice = UserId::new();
        let chat = ChatId::new();
        let (conn, _rx) = client(&hub, alice);
        hub.join(conn, chat).await;

        let client_id = MessageId::new().to_string();
        hub.send(conn, chat, &client_id, "première").await.unwrap();
        hub.send(conn, chat, &client_id, "première").await.unwrap();

        // One visible message despite two accepted sends.
        let window = hub.history.history(chat, 1, 10).await.unwrap();
        assert_eq!(window.len(), 1);

        // Drain the pipeline, then check the store agrees.
        hub.shutdown().await;
        let stored = hub.store().recent_messages(chat, 10, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id.to_string(), client_id);
    }

    #[tokio::test]
    async fn join_replays_recent_history_oldest_first() {
        let hub = test_hub().await;
        let alice = UserId::new();
        let bob = UserId::new();
        let chat = ChatId::new();

        let (alice_conn, _alice_rx) = client(&hub, alice);
        hub.join(alice_conn, chat).await;
        for text in ["un", "deux", "trois"] {
            hub.send(alice_conn, chat, &MessageId::new().to_string(), text)
                .await
                .unwrap();
        }

        let (bob_conn, mut bob_rx) = client(&hub, bob);
        hub.join(bob_conn, chat).await;

        let mut replayed = Vec::new();
        for _ in 0..3 {
            match wait_for(&mut bob_rx, |e| {
                matches!(e, ServerEvent::ReceiveMessage { .. })
            })
            .await
            {
                ServerEvent::ReceiveMessage { message } => replayed.push(message.text),
                _ => unreachable!(),
            }
        }
        assert_eq!(replayed, vec!["un", "deux", "trois"]);
    }

    #[tokio::test]
    async fn presence_transitions_are_broadcast_once() {
        let hub = test_hub().await;
        let watcher = UserId::new();
        let alice = UserId::new();

        let (_watcher_conn, mut watcher_rx) = client(&hub, watcher);

        // First connection: online event.  Second: silence.
        let (alice_conn1, _rx1) = client(&hub, alice);
        let online = wait_for(&mut watcher_rx, |e| {
            matches!(e, ServerEvent::UserStatusChanged { user_id, .. } if *user_id == alice)
        })
        .await;
        assert!(matches!(
            online,
            ServerEvent::UserStatusChanged { online: true, .. }
        ));

        let (alice_conn2, _rx2) = client(&hub, alice);
        hub.disconnect(alice_conn1);
        assert!(watcher_rx.try_recv().is_err());
        assert!(hub.presence.is_online(alice));

        // Last disconnect: offline event, dialogs dropped.
        hub.disconnect(alice_conn2);
        let offline = wait_for(&mut watcher_rx, |e| {
            matches!(e, ServerEvent::UserStatusChanged { user_id, .. } if *user_id == alice)
        })
        .await;
        assert!(matches!(
            offline,
            ServerEvent::UserStatusChanged { online: false, .. }
        ));
        assert!(!hub.presence.is_online(alice));
    }

    #[tokio::test]
    async fn online_queries_answer_on_the_calling_connection() {
        let hub = test_hub().await;
        let alice = UserId::new();
        let bob = UserId::new();

        let (alice_conn, mut alice_rx) = client(&hub, alice);
        let (_bob_conn, _bob_rx) = client(&hub, bob);

        hub.handle_command(alice_conn, ClientCommand::GetOnlineStatus { user_id: bob })
            .await
            .unwrap();
        let reply = wait_for(&mut alice_rx, |e| {
            matches!(e, ServerEvent::OnlineStatus { .. })
        })
        .await;
        assert!(matches!(
            reply,
            ServerEvent::OnlineStatus { user_id, online: true } if user_id == bob
        ));

        hub.handle_command(alice_conn, ClientCommand::ListOnlineUsers)
            .await
            .unwrap();
        let reply = wait_for(&mut alice_rx, |e| {
            matches!(e, ServerEvent::OnlineUsers { .. })
        })
        .await;
        match reply {
            ServerEvent::OnlineUsers { mut users } => {
                users.sort_by_key(|u| u.0);
                let mut expected = vec![alice, bob];
                expected.sort_by_key(|u| u.0);
                assert_eq!(users, expected);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn mark_read_notifies_the_original_sender() {
        let hub = test_hub().await;
        let alice = UserId::new();
        let bob = UserId::new();
        let chat = ChatId::new();

        let (alice_conn, mut alice_rx) = client(&hub, alice);
        let (bob_conn, mut bob_rx) = client(&hub, bob);
        hub.join(alice_conn, chat).await;
        hub.join(bob_conn, chat).await;

        let client_id = MessageId::new().to_string();
        hub.send(alice_conn, chat, &client_id, "lu ?").await.unwrap();
        let message_id = match wait_for(&mut bob_rx, |e| {
            matches!(e, ServerEvent::ReceiveMessage { .. })
        })
        .await
        {
            ServerEvent::ReceiveMessage { message } => message.id,
            _ => unreachable!(),
        };

        // Wait until the pipeline has persisted the row, then mark it read.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while hub.store().get_message(message_id).await.is_err() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "message never persisted"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        hub.mark_read(chat, message_id);

        let receipt = wait_for(&mut alice_rx, |e| {
            matches!(e, ServerEvent::StatusUpdate { .. })
        })
        .await;
        match receipt {
            ServerEvent::StatusUpdate {
                chat_id,
                message_id: id,
                status,
            } => {
                assert_eq!(chat_id, chat);
                assert_eq!(id, message_id);
                assert_eq!(status, DeliveryStatus::Read);
            }
            _ => unreachable!(),
        }

        let stored = hub.store().get_message(message_id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn dialog_runs_three_questions_then_closes() {
        let hub = test_hub().await;
        let questioner = UserId::new();
        let answerer = UserId::new();
        hub.store()
            .replace_questions(
                questioner,
                vec!["q1".to_string(), "q2".to_string(), "q3".to_string()],
            )
            .await
            .unwrap();

        let chat = hub
            .store()
            .get_or_create_chat_for_pair(questioner, answerer)
            .await
            .unwrap()
            .id;

        let (q_conn, mut q_rx) = client(&hub, questioner);
        let (a_conn, mut a_rx) = client(&hub, answerer);
        hub.join(q_conn, chat).await;
        hub.join(a_conn, chat).await;

        hub.handle_command(q_conn, ClientCommand::StartBotDialog { responder: answerer })
            .await
            .unwrap();

        let mut heard = Vec::new();
        for reply in ["r1", "r2", "r3"] {
            let question = wait_for(&mut a_rx, |e| {
                matches!(e, ServerEvent::ReceiveMessage { .. })
            })
            .await;
            match question {
                ServerEvent::ReceiveMessage { message } => {
                    assert_eq!(message.kind, MessageKind::BotQuestion);
                    heard.push(message.text);
                }
                _ => unreachable!(),
            }

            hub.send(a_conn, chat, &MessageId::new().to_string(), reply)
                .await
                .unwrap();

            // The questioner hears the reply, tagged as a bot answer.
            let echoed = wait_for(&mut q_rx, |e| {
                matches!(e, ServerEvent::ReceiveMessage { .. })
            })
            .await;
            match echoed {
                ServerEvent::ReceiveMessage { message } => {
                    assert_eq!(message.kind, MessageKind::BotAnswer);
                    assert_eq!(message.text, reply);
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(heard, vec!["q1", "q2", "q3"]);

        // After the third reply the closing system message arrives.
        let closing = wait_for(&mut a_rx, |e| {
            matches!(e, ServerEvent::ReceiveMessage { .. })
        })
        .await;
        match closing {
            ServerEvent::ReceiveMessage { message } => {
                assert_eq!(message.kind, MessageKind::System);
                assert_eq!(message.text, DIALOG_CLOSING_TEXT);
            }
            _ => unreachable!(),
        }

        // A fourth reply is an ordinary message: no further bot traffic.
        hub.send(a_conn, chat, &MessageId::new().to_string(), "r4")
            .await
            .unwrap();
        let after = wait_for(&mut q_rx, |e| {
            matches!(e, ServerEvent::ReceiveMessage { .. })
        })
        .await;
        match after {
            ServerEvent::ReceiveMessage { message } => {
                assert_eq!(message.kind, MessageKind::Normal);
            }
            _ => unreachable!(),
        }

        // The answerer got the ack for r4 and nothing else.
        let ack = next_event(&mut a_rx).await;
        assert!(matches!(ack, ServerEvent::MessageStatus { .. }));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stopping_a_dialog_notifies_the_answerer() {
        let hub = test_hub().await;
        let questioner = UserId::new();
        let answerer = UserId::new();
        hub.store()
            .replace_questions(questioner, vec!["q1".to_string(), "q2".to_string()])
            .await
            .unwrap();

        let (q_conn, _q_rx) = client(&hub, questioner);
        let (_a_conn, mut a_rx) = client(&hub, answerer);

        hub.start_dialog(q_conn, answerer).await;
        hub.stop_dialog(q_conn, answerer);

        let ended = wait_for(&mut a_rx, |e| {
            matches!(e, ServerEvent::BotDialogEnded { .. })
        })
        .await;
        assert!(matches!(
            ended,
            ServerEvent::BotDialogEnded { questioner: q } if q == questioner
        ));
        assert_eq!(hub.status().active_dialogs, 0);
    }

    #[tokio::test]
    async fn sibling_processes_exchange_messages_once() {
        // Two hubs on one shared backplane behave like two server
        // processes of the same cluster.
        let shared = Arc::new(MemoryBackplane::new());
        let hub_a = hub_on(shared.clone()).await;
        let hub_b = hub_on(shared).await;

        let alice = UserId::new();
        let bob = UserId::new();
        let chat = ChatId::new();

        let (alice_conn, mut alice_rx) = client(&hub_a, alice);
        let (bob_conn, mut bob_rx) = client(&hub_b, bob);
        hub_a.join(alice_conn, chat).await;
        hub_b.join(bob_conn, chat).await;

        hub_a
            .send(alice_conn, chat, &MessageId::new().to_string(), "traverse")
            .await
            .unwrap();

        // Bob, connected to the other process, still receives the message.
        let received = wait_for(&mut bob_rx, |e| {
            matches!(e, ServerEvent::ReceiveMessage { .. })
        })
        .await;
        match received {
            ServerEvent::ReceiveMessage { message } => {
                assert_eq!(message.text, "traverse");
            }
            _ => unreachable!(),
        }

        // Alice got her ack but never an echo of her own message, even
        // though her hub also hears the backplane.
        wait_for(&mut alice_rx, |e| {
            matches!(e, ServerEvent::MessageStatus { .. })
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = alice_rx.try_recv() {
            assert!(
                !matches!(event, ServerEvent::ReceiveMessage { .. }),
                "sender heard its own message back: {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn status_reports_the_live_picture() {
        let hub = test_hub().await;
        let alice = UserId::new();
        let (_conn1, _rx1) = client(&hub, alice);
        let (_conn2, _rx2) = client(&hub, UserId::new());

        let status = hub.status();
        assert_eq!(status.connections, 2);
        assert_eq!(status.online_users, 2);
        assert_eq!(status.active_dialogs, 0);
        assert!(status.backplane_reachable);
        assert_eq!(status.sockets.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_refuses_further_sends() {
        let hub = test_hub().await;
        let alice = UserId::new();
        let chat = ChatId::new();
        let (conn, _rx) = client(&hub, alice);
        hub.join(conn, chat).await;

        hub.shutdown().await;

        assert!(matches!(
            hub.send(conn, chat, &MessageId::new().to_string(), "late").await,
            Err(ChatError::ShuttingDown)
        ));
    }
}
