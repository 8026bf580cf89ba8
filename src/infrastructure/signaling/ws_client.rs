//! WebSocket signaling client
//!
//! Keeps one connection to the relay at `{url}/signaling/{user_id}` alive.
//! Every successful connection is published as a new [`SignalingChannel`]
//! instance on a watch channel; `None` is published while disconnected.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ParticipantId;
use crate::domain::signaling::{next_instance_id, ChannelMessage, SignalingChannel};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const INBOUND_CAPACITY: usize = 64;

type ChannelSlot = Option<Arc<dyn SignalingChannel>>;

/// Reconnecting client for the signaling relay
pub struct WsSignalingClient {
    endpoint: String,
    channels: watch::Receiver<ChannelSlot>,
    supervisor: JoinHandle<()>,
}

impl WsSignalingClient {
    pub fn spawn(base_url: &str, user_id: &ParticipantId, reconnect_delay: Duration) -> Self {
        let endpoint = endpoint(base_url, user_id);
        let (tx, channels) = watch::channel(None);
        let supervisor = tokio::spawn(supervise(endpoint.clone(), reconnect_delay, tx));

        Self {
            endpoint,
            channels,
            supervisor,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Channel instances as they come and go
    pub fn channels(&self) -> watch::Receiver<ChannelSlot> {
        self.channels.clone()
    }

    pub fn current(&self) -> ChannelSlot {
        self.channels.borrow().clone()
    }

    /// Wait until a connection is up
    pub async fn connected(&self) -> Result<Arc<dyn SignalingChannel>> {
        let mut channels = self.channels.clone();
        let slot = channels
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| CallError::ChannelUnavailable("signaling client stopped".to_string()))?;
        slot.clone()
            .ok_or_else(|| CallError::ChannelUnavailable("signaling client stopped".to_string()))
    }
}

impl Drop for WsSignalingClient {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

fn endpoint(base_url: &str, user_id: &ParticipantId) -> String {
    let base = base_url
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    format!("{}/signaling/{}", base.trim_end_matches('/'), user_id)
}

async fn supervise(endpoint: String, reconnect_delay: Duration, channels: watch::Sender<ChannelSlot>) {
    loop {
        match connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => {
                let instance_id = next_instance_id();
                info!("Signaling connected to {} (instance {})", endpoint, instance_id);

                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
                let channel = Arc::new(WsChannel {
                    instance_id,
                    outbound: outbound_tx,
                    inbound: inbound.clone(),
                    connected: Arc::new(AtomicBool::new(true)),
                });

                channels.send_replace(Some(channel.clone()));
                run_connection(stream, outbound_rx, inbound).await;
                channel.connected.store(false, Ordering::SeqCst);
                channels.send_replace(None);

                warn!("Signaling connection {} lost", instance_id);
            }
            Err(e) => warn!("Signaling connect to {} failed: {}", endpoint, e),
        }

        if channels.is_closed() {
            debug!("No signaling observers left, stopping client");
            break;
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn run_connection(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: broadcast::Sender<ChannelMessage>,
) {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            Some(text) = outbound.recv() => {
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!("Failed to send signaling frame: {}", e);
                    break;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ChannelMessage>(&text) {
                    Ok(message) => {
                        let _ = inbound.send(message);
                    }
                    Err(e) => warn!("Failed to parse signaling frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Signaling connection closed by relay");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Signaling WebSocket error: {}", e);
                    break;
                }
            },
        }
    }
}

/// One live WebSocket connection
struct WsChannel {
    instance_id: u64,
    outbound: mpsc::UnboundedSender<String>,
    inbound: broadcast::Sender<ChannelMessage>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl SignalingChannel for WsChannel {
    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: ChannelMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(CallError::ChannelUnavailable(format!(
                "signaling connection {} is closed",
                self.instance_id
            )));
        }
        let text = serde_json::to_string(&message)?;
        self.outbound
            .send(text)
            .map_err(|_| CallError::ChannelUnavailable("signaling writer stopped".to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.inbound.subscribe()
    }
}
