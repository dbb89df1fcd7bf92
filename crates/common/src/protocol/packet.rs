// Packet envelope handed to the transport.
//
// The transport only needs the addressing; everything else is one of two
// channels: negotiation control traffic or batches of session activities.

use serde::{Deserialize, Serialize};

use crate::activity::Activity;
use crate::protocol::negotiation::NegotiationMessage;
use crate::types::UserId;

/// Activities produced within one session, in the order they were fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityBatch {
    pub session_id: String,
    pub activities: Vec<Activity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "body", rename_all = "snake_case")]
pub enum Message {
    Negotiation(NegotiationMessage),
    Activities(ActivityBatch),
}

impl Message {
    pub fn as_negotiation(&self) -> Option<&NegotiationMessage> {
        match self {
            Self::Negotiation(message) => Some(message),
            Self::Activities(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Negotiation(message) => message.kind(),
            Self::Activities(_) => "activities",
        }
    }
}

impl From<NegotiationMessage> for Message {
    fn from(message: NegotiationMessage) -> Self {
        Self::Negotiation(message)
    }
}

impl From<ActivityBatch> for Message {
    fn from(batch: ActivityBatch) -> Self {
        Self::Activities(batch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub from: UserId,
    pub to: UserId,
    pub message: Message,
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ResourcePath;

    #[test]
    fn activity_packets_keep_batch_order() {
        let source = UserId::new("alice");
        let batch = ActivityBatch {
            session_id: "S1".into(),
            activities: (0..3)
                .map(|offset| Activity::TextEdit {
                    source: source.clone(),
                    path: ResourcePath::new("G1", "a.txt"),
                    offset,
                    text: offset.to_string(),
                    replaced: String::new(),
                })
                .collect(),
        };
        let packet = Packet { from: source, to: UserId::new("bob"), message: batch.clone().into() };

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded.message, Message::Activities(batch));
    }

    #[test]
    fn channel_tag_is_explicit() {
        let packet = Packet {
            from: UserId::new("alice"),
            to: UserId::new("bob"),
            message: NegotiationMessage::SessionAck { negotiation_id: "n1".into() }.into(),
        };
        let json: serde_json::Value = serde_json::from_slice(&packet.encode().unwrap()).unwrap();
        assert_eq!(json["message"]["channel"], "negotiation");
        assert_eq!(json["message"]["body"]["type"], "session_ack");
        assert_eq!(packet.message.kind(), "session_ack");
    }
}
