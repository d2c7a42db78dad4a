//! WebSocket endpoint for the chat protocol.
//!
//! Clients connect with `GET /ws?user_id=<uuid>`.  Commands arrive as JSON
//! text frames and events leave the same way; the wire types live in
//! `rencontre-shared` so clients and server agree by construction.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rencontre_shared::{ClientCommand, ServerEvent, UserId};

use crate::api::AppState;
use crate::error::ServerError;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    user_id: Option<String>,
}

/// WebSocket upgrade handler.
///
/// Rejects the request before upgrading when the caller did not identify
/// itself with a well-formed user id.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let raw = params.user_id.ok_or(ServerError::MissingUserId)?;
    let user = UserId::parse(&raw).map_err(|_| ServerError::InvalidUserId(raw))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

/// Handle an individual WebSocket connection.
///
/// Spawns a sender task that pumps hub events out to the socket, then
/// reads client frames until the peer goes away.  The hub is told about
/// the disconnect exactly once, on the way out.
async fn handle_socket(socket: WebSocket, state: AppState, user: UserId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let events_tx = tx.clone();
    let conn = state.hub.connect(user, tx);

    let sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to encode event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                let command: ClientCommand = match serde_json::from_str(&text) {
                    Ok(command) => command,
                    Err(e) => {
                        debug!(conn = %conn, error = %e, "unparseable frame");
                        let _ = events_tx.send(ServerEvent::Error {
                            message: format!("unrecognized command: {e}"),
                        });
                        continue;
                    }
                };

                if let Err(e) = state.hub.handle_command(conn, command).await {
                    let _ = events_tx.send(ServerEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
            Message::Close(_) => break,
            _ => {} // Ignore binary, ping (handled by tungstenite layer)
        }
    }

    state.hub.disconnect(conn);
    sender_task.abort();
}
