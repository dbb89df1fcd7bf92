// Transport seam: reliable, per-peer ordered delivery of packets.
//
// The session layer never talks to the network directly. It sends typed
// messages to a peer address and registers filtered listeners for inbound
// packets. Handlers run on the transport's delivery context and must not
// block; slow work is handed off to a spawned task.

pub mod loopback;

use std::sync::Arc;

use tandem_common::protocol::negotiation::NegotiationScope;
use tandem_common::protocol::packet::{Message, Packet};
use tandem_common::types::UserId;
use thiserror::Error;

pub use loopback::{LoopbackNetwork, LoopbackTransport};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is not reachable")]
    PeerUnreachable(UserId),

    #[error("failed to encode {kind} packet: {reason}")]
    Encode { kind: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

pub type PacketFilter = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;
pub type PacketHandler = Arc<dyn Fn(Packet) + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Address of the participant this transport sends as.
    fn local_user(&self) -> &UserId;

    fn send(&self, to: &UserId, message: Message) -> Result<(), TransportError>;

    /// Deliver every inbound packet matching `filter` to `handler`.
    fn add_listener(&self, filter: PacketFilter, handler: PacketHandler) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Negotiation control traffic of one scope.
pub fn negotiation_filter(scope: NegotiationScope) -> PacketFilter {
    Arc::new(move |packet: &Packet| {
        packet.message.as_negotiation().is_some_and(|message| message.scope() == scope)
    })
}

/// Activity batches addressed to one session.
pub fn activity_filter(session_id: impl Into<String>) -> PacketFilter {
    let session_id = session_id.into();
    Arc::new(move |packet: &Packet| match &packet.message {
        Message::Activities(batch) => batch.session_id == session_id,
        Message::Negotiation(_) => false,
    })
}
