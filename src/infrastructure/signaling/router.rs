//! Signaling event router
//!
//! The only component that talks to a [`SignalingChannel`]. It owns at most
//! one channel binding at a time: binding the same instance again is a no-op,
//! binding a new instance aborts the previous listener before attaching.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::ParticipantId;
use crate::domain::signaling::{
    ChannelMessage, InboundSignal, OutboundSignal, SignalingChannel, CALL_ANSWERED, CALL_ENDED,
    CALL_STATUS, INCOMING_CALL,
};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Binding {
    channel: Arc<dyn SignalingChannel>,
    listener: JoinHandle<()>,
}

pub struct SignalingRouter {
    inbound: mpsc::UnboundedSender<InboundSignal>,
    binding: Mutex<Option<Binding>>,
}

impl SignalingRouter {
    /// Decoded inbound events are delivered to `inbound`
    pub fn new(inbound: mpsc::UnboundedSender<InboundSignal>) -> Self {
        Self {
            inbound,
            binding: Mutex::new(None),
        }
    }

    /// Attach to `channel`; returns false if that instance is already bound
    pub async fn bind(&self, channel: Arc<dyn SignalingChannel>) -> bool {
        let mut binding = self.binding.lock().await;

        if let Some(current) = binding.as_ref() {
            if current.channel.instance_id() == channel.instance_id() {
                debug!("Signaling channel {} already bound", channel.instance_id());
                return false;
            }
        }

        if let Some(previous) = binding.take() {
            previous.listener.abort();
            info!(
                "Replacing signaling channel {} with {}",
                previous.channel.instance_id(),
                channel.instance_id()
            );
        } else {
            info!("Bound signaling channel {}", channel.instance_id());
        }

        let listener = tokio::spawn(listen(channel.subscribe(), self.inbound.clone()));
        *binding = Some(Binding { channel, listener });
        true
    }

    pub async fn unbind(&self) {
        if let Some(previous) = self.binding.lock().await.take() {
            previous.listener.abort();
            info!("Unbound signaling channel {}", previous.channel.instance_id());
        }
    }

    pub async fn bound_instance(&self) -> Option<u64> {
        self.binding
            .lock()
            .await
            .as_ref()
            .map(|b| b.channel.instance_id())
    }

    /// Keep the binding in step with a reconnecting transport
    pub fn follow(
        self: &Arc<Self>,
        mut channels: watch::Receiver<Option<Arc<dyn SignalingChannel>>>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let current = channels.borrow_and_update().clone();
                match current {
                    Some(channel) => {
                        router.bind(channel).await;
                    }
                    None => router.unbind().await,
                }
                if channels.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Send `signal` to `to` over the bound channel
    pub async fn emit(&self, to: &ParticipantId, signal: &OutboundSignal) -> Result<()> {
        let channel = self
            .binding
            .lock()
            .await
            .as_ref()
            .map(|b| b.channel.clone())
            .ok_or_else(|| CallError::ChannelUnavailable("no signaling channel bound".to_string()))?;

        if !channel.is_connected() {
            return Err(CallError::ChannelUnavailable(format!(
                "signaling channel {} is disconnected",
                channel.instance_id()
            )));
        }

        let message = encode(to, signal)?;
        channel.send(message).await?;

        counter!("signaling_messages_total", "direction" => "out", "event" => signal.event_name())
            .increment(1);
        debug!("Emitted {} for call {} to {}", signal.event_name(), signal.session_id(), to);
        Ok(())
    }
}

impl Drop for SignalingRouter {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.listener.abort();
        }
    }
}

fn encode(to: &ParticipantId, signal: &OutboundSignal) -> Result<ChannelMessage> {
    Ok(ChannelMessage::new(
        signal.event_name(),
        Some(to.clone()),
        signal.payload()?,
    ))
}

/// Decode a channel message; `Ok(None)` for events the call core does not consume
fn decode(message: ChannelMessage) -> Result<Option<InboundSignal>> {
    let signal = match message.event.as_str() {
        INCOMING_CALL => InboundSignal::IncomingCall(serde_json::from_value(message.payload)?),
        CALL_ANSWERED => InboundSignal::CallAnswered(serde_json::from_value(message.payload)?),
        CALL_ENDED => InboundSignal::CallEnded(serde_json::from_value(message.payload)?),
        CALL_STATUS => InboundSignal::CallStatus(serde_json::from_value(message.payload)?),
        _ => return Ok(None),
    };
    Ok(Some(signal))
}

async fn listen(
    mut messages: broadcast::Receiver<ChannelMessage>,
    inbound: mpsc::UnboundedSender<InboundSignal>,
) {
    loop {
        match messages.recv().await {
            Ok(message) => {
                let event = message.event.clone();
                match decode(message) {
                    Ok(Some(signal)) => {
                        counter!("signaling_messages_total", "direction" => "in", "event" => event)
                            .increment(1);
                        if inbound.send(signal).is_err() {
                            break;
                        }
                    }
                    Ok(None) => debug!("Ignoring signaling event {}", event),
                    Err(e) => warn!("Malformed {} event: {}", event, e),
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Signaling listener lagged, {} messages skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Signaling channel closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::value_object::EndReason;
    use crate::domain::shared::value_objects::SessionId;
    use crate::domain::signaling::{EndCall, END_CALL};
    use crate::infrastructure::signaling::MemorySignalingHub;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};

    struct FakeChannel {
        id: u64,
        connected: AtomicBool,
        inbound: broadcast::Sender<ChannelMessage>,
        sent: std::sync::Mutex<Vec<ChannelMessage>>,
    }

    impl FakeChannel {
        fn new(id: u64) -> Arc<Self> {
            let (inbound, _) = broadcast::channel(16);
            Arc::new(Self {
                id,
                connected: AtomicBool::new(true),
                inbound,
                sent: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn deliver(&self, event: &str, payload: serde_json::Value) {
            let _ = self.inbound.send(ChannelMessage::new(event, None, payload));
        }
    }

    #[async_trait]
    impl SignalingChannel for FakeChannel {
        fn instance_id(&self) -> u64 {
            self.id
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn send(&self, message: ChannelMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
            self.inbound.subscribe()
        }
    }

    fn end_call() -> OutboundSignal {
        OutboundSignal::EndCall(EndCall {
            session_id: SessionId::new("s1"),
            reason: EndReason::Hangup,
        })
    }

    fn ended_payload() -> serde_json::Value {
        json!({"sessionId": "s1", "reason": "hangup"})
    }

    #[tokio::test]
    async fn test_bind_is_idempotent_per_instance() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(tx);
        let channel = FakeChannel::new(1);

        assert!(router.bind(channel.clone()).await);
        assert!(!router.bind(channel.clone()).await);

        channel.deliver(CALL_ENDED, ended_payload());
        let signal = rx.recv().await.unwrap();
        assert!(matches!(signal, InboundSignal::CallEnded(_)));

        // a duplicate listener would deliver twice
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rebind_drops_old_listener() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(tx);
        let old = FakeChannel::new(1);
        let new = FakeChannel::new(2);

        router.bind(old.clone()).await;
        router.bind(new.clone()).await;
        assert_eq!(router.bound_instance().await, Some(2));
        tokio::task::yield_now().await;

        old.deliver(CALL_ENDED, ended_payload());
        new.deliver(CALL_ENDED, ended_payload());

        assert!(rx.recv().await.is_some());
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rebind_across_transports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(tx);
        let old_hub = MemorySignalingHub::new();
        let new_hub = MemorySignalingHub::new();

        assert!(router.bind(old_hub.connect("bob")).await);
        assert!(router.bind(new_hub.connect("bob")).await);
        tokio::task::yield_now().await;

        let alice = new_hub.connect("alice");
        let end = ChannelMessage::new(
            END_CALL,
            Some(ParticipantId::from("bob")),
            ended_payload(),
        );
        assert_ok!(alice.send(end).await);

        let signal = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(signal, InboundSignal::CallEnded(_)));
    }

    #[tokio::test]
    async fn test_emit_without_channel_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(tx);

        let result = router.emit(&ParticipantId::from("u2"), &end_call()).await;
        assert!(matches!(result, Err(CallError::ChannelUnavailable(_))));
    }

    #[tokio::test]
    async fn test_emit_on_disconnected_channel_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(tx);
        let channel = FakeChannel::new(1);
        channel.connected.store(false, Ordering::SeqCst);
        router.bind(channel.clone()).await;

        assert_err!(router.emit(&ParticipantId::from("u2"), &end_call()).await);
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emit_addresses_recipient() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(tx);
        let channel = FakeChannel::new(1);
        router.bind(channel.clone()).await;

        assert_ok!(router.emit(&ParticipantId::from("u2"), &end_call()).await);

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, END_CALL);
        assert_eq!(sent[0].to, Some(ParticipantId::from("u2")));
        assert_eq!(sent[0].payload, ended_payload());
    }

    #[tokio::test]
    async fn test_follow_rebinds_on_reconnect() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let router = Arc::new(SignalingRouter::new(tx));
        let (channels_tx, channels_rx) = watch::channel::<Option<Arc<dyn SignalingChannel>>>(None);

        let follower = router.follow(channels_rx);
        channels_tx.send_replace(Some(FakeChannel::new(7)));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(router.bound_instance().await, Some(7));

        channels_tx.send_replace(None);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(router.bound_instance().await, None);

        channels_tx.send_replace(Some(FakeChannel::new(8)));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(router.bound_instance().await, Some(8));

        drop(channels_tx);
        follower.await.unwrap();
    }

    #[test]
    fn test_decode_skips_unknown_and_rejects_malformed() {
        let unknown = ChannelMessage::new("presence", None, json!({}));
        assert!(decode(unknown).unwrap().is_none());

        let malformed = ChannelMessage::new(INCOMING_CALL, None, json!({"sessionId": 5}));
        assert!(matches!(decode(malformed), Err(CallError::Serialization(_))));
    }
}
