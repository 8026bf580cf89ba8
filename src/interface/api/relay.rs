/// Signaling relay for call clients
///
/// Each user holds one WebSocket at `/signaling/:user_id`. Client events are
/// rewritten into the events their recipient receives and forwarded to the
/// addressed user only.
use crate::domain::shared::value_objects::ParticipantId;
use crate::domain::signaling::{ChannelMessage, INITIATE_CALL};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One connected user
#[derive(Debug, Clone)]
struct RelayClient {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<ChannelMessage>,
    connected_at: chrono::DateTime<chrono::Utc>,
}

/// Relay state
pub struct RelayState {
    /// Connected users (user_id -> outbound queue of their socket)
    clients: RwLock<HashMap<ParticipantId, RelayClient>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection; a newer connection replaces an older one
    async fn register(
        &self,
        user: ParticipantId,
        sender: mpsc::UnboundedSender<ChannelMessage>,
    ) -> Uuid {
        let connection_id = Uuid::new_v4();
        let mut clients = self.clients.write().await;

        let client = RelayClient {
            connection_id,
            sender,
            connected_at: chrono::Utc::now(),
        };
        if let Some(previous) = clients.insert(user.clone(), client) {
            info!(
                "User {} reconnected, replacing connection {} from {}",
                user, previous.connection_id, previous.connected_at
            );
        }
        gauge!("signaling_clients").set(clients.len() as f64);

        connection_id
    }

    /// Remove a connection unless it was already replaced
    async fn unregister(&self, user: &ParticipantId, connection_id: Uuid) {
        let mut clients = self.clients.write().await;

        if clients
            .get(user)
            .map_or(false, |c| c.connection_id == connection_id)
        {
            clients.remove(user);
        }
        gauge!("signaling_clients").set(clients.len() as f64);
    }

    pub async fn is_online(&self, user: &ParticipantId) -> bool {
        self.clients.read().await.contains_key(user)
    }

    pub async fn online_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn deliver(&self, to: &ParticipantId, message: ChannelMessage) -> bool {
        let clients = self.clients.read().await;
        match clients.get(to) {
            Some(client) => client.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Forward a client event to its recipient
    async fn route(&self, sender: &ParticipantId, message: ChannelMessage) {
        let event = message.event.clone();

        let to = match message.to.clone() {
            Some(to) => to,
            None => {
                warn!("Dropping {} from {}: no recipient", event, sender);
                return;
            }
        };

        let relayed = match message.relayed_from(sender) {
            Some(relayed) => relayed,
            None => {
                warn!("Refusing to relay {} from {}", event, sender);
                return;
            }
        };

        let notice = if event == INITIATE_CALL {
            relayed.unavailable_notice()
        } else {
            None
        };

        if self.deliver(&to, relayed).await {
            counter!("signaling_messages_total", "direction" => "relayed", "event" => event.clone())
                .increment(1);
            debug!("Relayed {} from {} to {}", event, sender, to);
        } else if let Some(notice) = notice {
            info!("Call target {} is offline, notifying {}", to, sender);
            self.deliver(sender, notice).await;
        } else {
            debug!("Dropped {} for offline user {}", event, to);
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

/// Create signaling relay router
pub fn relay_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/signaling/:user_id", get(websocket_handler))
        .with_state(state)
}

/// WebSocket handler for signaling
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ParticipantId::new(user_id), state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, user: ParticipantId, state: Arc<RelayState>) {
    info!("Signaling connection established for user: {}", user);

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ChannelMessage>();
    let connection_id = state.register(user.clone(), tx).await;

    // Task to send messages to this user
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Task to receive messages from this user
    let state_clone = state.clone();
    let user_clone = user.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    debug!("Received signaling message from {}: {}", user_clone, text);

                    match serde_json::from_str::<ChannelMessage>(&text) {
                        Ok(message) => state_clone.route(&user_clone, message).await,
                        Err(e) => warn!("Failed to parse signaling message: {}", e),
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket closed for user: {}", user_clone);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(_) => {
                    warn!("Received unexpected message type from {}", user_clone);
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", user_clone, e);
                    break;
                }
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => {
            debug!("Send task finished for {}", user);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("Receive task finished for {}", user);
            send_task.abort();
        }
    }

    // Cleanup
    state.unregister(&user, connection_id).await;
    info!("Signaling connection closed for user: {}", user);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signaling::{CALL_ANSWERED, CALL_STATUS, INCOMING_CALL};
    use serde_json::json;

    fn message(event: &str, to: &str) -> ChannelMessage {
        ChannelMessage::new(
            event,
            Some(ParticipantId::from(to)),
            json!({"sessionId": "s1", "localDescription": {"type": "answer", "sdp": "v=0"}}),
        )
    }

    #[tokio::test]
    async fn test_route_rewrites_and_delivers() {
        let state = RelayState::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register(ParticipantId::from("alice"), tx).await;

        state
            .route(&ParticipantId::from("bob"), message("answerCall", "alice"))
            .await;

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.event, CALL_ANSWERED);
        assert_eq!(delivered.from, Some(ParticipantId::from("bob")));
        assert!(delivered.payload.get("remoteDescription").is_some());
    }

    #[tokio::test]
    async fn test_offline_target_gets_status_notice() {
        let state = RelayState::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register(ParticipantId::from("alice"), tx).await;

        state
            .route(&ParticipantId::from("alice"), message(INITIATE_CALL, "bob"))
            .await;

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.event, CALL_STATUS);
        assert_eq!(notice.payload["status"], "unavailable");
    }

    #[tokio::test]
    async fn test_server_events_are_not_relayed() {
        let state = RelayState::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register(ParticipantId::from("alice"), tx).await;

        state
            .route(&ParticipantId::from("bob"), message(INCOMING_CALL, "alice"))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_connection_does_not_unregister_newer() {
        let state = RelayState::new();
        let alice = ParticipantId::from("alice");
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();

        let old = state.register(alice.clone(), old_tx).await;
        let _new = state.register(alice.clone(), new_tx).await;
        state.unregister(&alice, old).await;

        assert!(state.is_online(&alice).await);
        assert_eq!(state.online_count().await, 1);
    }
}
