//! In-process signaling relay
//!
//! Behaves like the WebSocket relay without a network: every connected user
//! gets a [`MemoryChannel`], client events are rewritten with
//! [`ChannelMessage::relayed_from`] and delivered to the addressed user.
//! Connecting the same user again replaces the previous channel instance.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ParticipantId;
use crate::domain::signaling::{next_instance_id, ChannelMessage, SignalingChannel, INITIATE_CALL};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

struct Registration {
    instance_id: u64,
    inbound: broadcast::Sender<ChannelMessage>,
}

#[derive(Default)]
struct HubInner {
    clients: RwLock<HashMap<ParticipantId, Registration>>,
}

impl HubInner {
    fn is_current(&self, user: &ParticipantId, instance_id: u64) -> bool {
        self.clients
            .read()
            .map(|clients| clients.get(user).map_or(false, |r| r.instance_id == instance_id))
            .unwrap_or(false)
    }

    fn deliver(&self, to: &ParticipantId, message: ChannelMessage) -> bool {
        let clients = match self.clients.read() {
            Ok(clients) => clients,
            Err(_) => return false,
        };
        match clients.get(to) {
            Some(registration) => {
                // no subscriber yet is still a delivery to an online user
                let _ = registration.inbound.send(message);
                true
            }
            None => false,
        }
    }

    fn route(&self, sender: &ParticipantId, message: ChannelMessage) -> Result<()> {
        let to = message
            .to
            .clone()
            .ok_or_else(|| CallError::Internal(format!("{} event has no recipient", message.event)))?;

        let event = message.event.clone();
        let relayed = match message.relayed_from(sender) {
            Some(relayed) => relayed,
            None => {
                warn!("Refusing to relay {} from {}", event, sender);
                return Ok(());
            }
        };

        let notice = if event == INITIATE_CALL {
            relayed.unavailable_notice()
        } else {
            None
        };

        if self.deliver(&to, relayed) {
            debug!("Relayed {} from {} to {}", event, sender, to);
        } else if let Some(notice) = notice {
            debug!("{} is offline, telling {}", to, sender);
            self.deliver(sender, notice);
        } else {
            debug!("Dropped {} for offline user {}", event, to);
        }
        Ok(())
    }
}

/// In-process relay shared by every participant of a test or demo
#[derive(Clone, Default)]
pub struct MemorySignalingHub {
    inner: Arc<HubInner>,
}

impl MemorySignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `user`, replacing any earlier connection of the same user
    pub fn connect(&self, user: impl Into<ParticipantId>) -> Arc<MemoryChannel> {
        let user = user.into();
        let instance_id = next_instance_id();
        let (inbound, _) = broadcast::channel(CHANNEL_CAPACITY);

        if let Ok(mut clients) = self.inner.clients.write() {
            clients.insert(
                user.clone(),
                Registration {
                    instance_id,
                    inbound: inbound.clone(),
                },
            );
        }
        debug!("{} connected to memory hub as instance {}", user, instance_id);

        Arc::new(MemoryChannel {
            instance_id,
            user,
            hub: self.inner.clone(),
            inbound,
        })
    }

    pub fn disconnect(&self, user: &ParticipantId) {
        if let Ok(mut clients) = self.inner.clients.write() {
            clients.remove(user);
        }
    }

    pub fn is_online(&self, user: &ParticipantId) -> bool {
        self.inner
            .clients
            .read()
            .map(|clients| clients.contains_key(user))
            .unwrap_or(false)
    }
}

/// One user's connection to a [`MemorySignalingHub`]
pub struct MemoryChannel {
    instance_id: u64,
    user: ParticipantId,
    hub: Arc<HubInner>,
    inbound: broadcast::Sender<ChannelMessage>,
}

impl MemoryChannel {
    pub fn user(&self) -> &ParticipantId {
        &self.user
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn is_connected(&self) -> bool {
        self.hub.is_current(&self.user, self.instance_id)
    }

    async fn send(&self, message: ChannelMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(CallError::ChannelUnavailable(format!(
                "memory channel {} for {} is closed",
                self.instance_id, self.user
            )));
        }
        self.hub.route(&self.user, message)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.inbound.subscribe()
    }
}
