//! Signaling event contract and the channel port
//!
//! Outbound events (`initiateCall`, `answerCall`, `endCall`) are what a
//! client emits; the relay turns them into the inbound events
//! (`incomingCall`, `callAnswered`, `callEnded`) delivered to the other
//! party. `callStatus` is advisory and flows server to client only.

use crate::domain::call::value_object::{EndReason, MediaKind};
use crate::domain::peer::SessionDescription;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{ParticipantId, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

pub const INITIATE_CALL: &str = "initiateCall";
pub const ANSWER_CALL: &str = "answerCall";
pub const END_CALL: &str = "endCall";
pub const INCOMING_CALL: &str = "incomingCall";
pub const CALL_ANSWERED: &str = "callAnswered";
pub const CALL_ENDED: &str = "callEnded";
pub const CALL_STATUS: &str = "callStatus";

/// Status value the relay sends when the callee is not connected
pub const STATUS_UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCall {
    pub session_id: SessionId,
    pub caller_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub call_type: MediaKind,
    pub local_description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerCall {
    pub session_id: SessionId,
    pub local_description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCall {
    pub session_id: SessionId,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub session_id: SessionId,
    pub caller_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub call_type: MediaKind,
    pub remote_description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswered {
    pub session_id: SessionId,
    pub remote_description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub session_id: SessionId,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusNotice {
    pub session_id: SessionId,
    pub status: String,
}

/// Side effects the state machine asks to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSignal {
    InitiateCall(InitiateCall),
    AnswerCall(AnswerCall),
    EndCall(EndCall),
}

impl OutboundSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundSignal::InitiateCall(_) => INITIATE_CALL,
            OutboundSignal::AnswerCall(_) => ANSWER_CALL,
            OutboundSignal::EndCall(_) => END_CALL,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            OutboundSignal::InitiateCall(p) => &p.session_id,
            OutboundSignal::AnswerCall(p) => &p.session_id,
            OutboundSignal::EndCall(p) => &p.session_id,
        }
    }

    /// Setup messages whose loss leaves the remote side unable to proceed
    pub fn is_setup(&self) -> bool {
        !matches!(self, OutboundSignal::EndCall(_))
    }

    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            OutboundSignal::InitiateCall(p) => serde_json::to_value(p),
            OutboundSignal::AnswerCall(p) => serde_json::to_value(p),
            OutboundSignal::EndCall(p) => serde_json::to_value(p),
        }
    }
}

/// Events delivered by the channel that drive the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    IncomingCall(IncomingCall),
    CallAnswered(CallAnswered),
    CallEnded(CallEnded),
    CallStatus(CallStatusNotice),
}

impl InboundSignal {
    pub fn session_id(&self) -> &SessionId {
        match self {
            InboundSignal::IncomingCall(p) => &p.session_id,
            InboundSignal::CallAnswered(p) => &p.session_id,
            InboundSignal::CallEnded(p) => &p.session_id,
            InboundSignal::CallStatus(p) => &p.session_id,
        }
    }
}

/// Named event as carried by a signaling channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ParticipantId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ChannelMessage {
    pub fn new(event: impl Into<String>, to: Option<ParticipantId>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            from: None,
            to,
            payload,
        }
    }

    /// Rewrite a client-emitted event into the event its recipient receives
    ///
    /// Returns `None` for events a client is not allowed to relay.
    pub fn relayed_from(mut self, sender: &ParticipantId) -> Option<ChannelMessage> {
        let inbound = match self.event.as_str() {
            INITIATE_CALL => INCOMING_CALL,
            ANSWER_CALL => CALL_ANSWERED,
            END_CALL => CALL_ENDED,
            _ => return None,
        };

        if let Some(fields) = self.payload.as_object_mut() {
            if let Some(description) = fields.remove("localDescription") {
                fields.insert("remoteDescription".to_string(), description);
            }
        }

        self.event = inbound.to_string();
        self.from = Some(sender.clone());
        Some(self)
    }

    /// Advisory notice telling `sender` its call target is not reachable
    pub fn unavailable_notice(&self) -> Option<ChannelMessage> {
        let session_id = self.payload.get("sessionId")?.as_str()?;
        let notice = CallStatusNotice {
            session_id: SessionId::new(session_id),
            status: STATUS_UNAVAILABLE.to_string(),
        };
        let payload = serde_json::to_value(notice).ok()?;
        Some(ChannelMessage::new(CALL_STATUS, self.from.clone(), payload))
    }
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a channel instance id, unique across all transports in the process
pub fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Bidirectional signaling transport
///
/// Every reconnect produces a new instance with a new `instance_id` taken
/// from [`next_instance_id`]; the router uses it to keep listener
/// registration idempotent.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    fn instance_id(&self) -> u64;

    fn is_connected(&self) -> bool;

    async fn send(&self, message: ChannelMessage) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initiate_call_payload_shape() {
        let signal = OutboundSignal::InitiateCall(InitiateCall {
            session_id: SessionId::new("s1"),
            caller_id: ParticipantId::from("u1"),
            receiver_id: ParticipantId::from("u2"),
            call_type: MediaKind::Video,
            local_description: SessionDescription::offer("v=0"),
        });

        let payload = signal.payload().unwrap();
        assert_eq!(
            payload,
            json!({
                "sessionId": "s1",
                "callerId": "u1",
                "receiverId": "u2",
                "callType": "video",
                "localDescription": {"type": "offer", "sdp": "v=0"}
            })
        );
        assert!(signal.is_setup());
    }

    #[test]
    fn test_relay_rewrites_initiate_into_incoming() {
        let message = ChannelMessage::new(
            INITIATE_CALL,
            Some(ParticipantId::from("u2")),
            json!({
                "sessionId": "s1",
                "callerId": "u1",
                "receiverId": "u2",
                "callType": "voice",
                "localDescription": {"type": "offer", "sdp": "v=0"}
            }),
        );

        let relayed = message.relayed_from(&ParticipantId::from("u1")).unwrap();
        assert_eq!(relayed.event, INCOMING_CALL);
        assert_eq!(relayed.from, Some(ParticipantId::from("u1")));

        let incoming: IncomingCall = serde_json::from_value(relayed.payload).unwrap();
        assert_eq!(incoming.remote_description.sdp, "v=0");
        assert_eq!(incoming.call_type, MediaKind::Voice);
    }

    #[test]
    fn test_relay_refuses_server_events() {
        let message = ChannelMessage::new(CALL_ENDED, None, json!({}));
        assert!(message.relayed_from(&ParticipantId::from("u1")).is_none());
    }

    #[test]
    fn test_unavailable_notice_addresses_sender() {
        let mut message = ChannelMessage::new(
            INITIATE_CALL,
            Some(ParticipantId::from("u9")),
            json!({"sessionId": "s7"}),
        );
        message.from = Some(ParticipantId::from("u1"));

        let notice = message.unavailable_notice().unwrap();
        assert_eq!(notice.event, CALL_STATUS);
        assert_eq!(notice.to, Some(ParticipantId::from("u1")));
        assert_eq!(notice.payload, json!({"sessionId": "s7", "status": "unavailable"}));
    }
}
