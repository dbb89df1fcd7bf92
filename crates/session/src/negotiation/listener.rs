// Demultiplexer between the transport and negotiation instances.
//
// Session-scoped control traffic is always observed; resource-scoped
// traffic only while a session is running. New session offers are refused
// with a busy cancel for as long as a session is running or being joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tandem_common::protocol::negotiation::{
    CancelCode, NegotiationMessage, NegotiationScope, ResourceNegotiationData,
};
use tandem_common::protocol::packet::{Message, Packet};
use tandem_common::types::UserId;
use tracing::{debug, info, warn};

use super::registry::NegotiationRegistry;
use super::resource::ResourceNegotiation;
use super::session::SessionNegotiation;
use crate::lifecycle::{NegotiationReport, SessionEndReason, SessionLifecycleListener};
use crate::manager::SessionSlot;
use crate::session::Session;
use crate::transport::{negotiation_filter, ListenerId, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOffer {
    pub negotiation_id: String,
    pub protocol_version: String,
    pub session_id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOffer {
    pub negotiation_id: String,
    pub session_id: String,
    pub resources: Vec<ResourceNegotiationData>,
}

/// Creates and starts inbound negotiations handed over by the listener.
pub trait NegotiationHandoff: Send + Sync {
    /// Returns false if no negotiation was started.
    fn session_offer_received(&self, from: UserId, offer: SessionOffer) -> bool;

    fn resource_offer_received(&self, from: UserId, offer: ResourceOffer);
}

pub struct NegotiationProtocolListener {
    transport: Arc<dyn Transport>,
    session_negotiations: Arc<NegotiationRegistry<SessionNegotiation>>,
    resource_negotiations: Arc<NegotiationRegistry<ResourceNegotiation>>,
    slot: Arc<SessionSlot>,
    handoff: Weak<dyn NegotiationHandoff>,
    rejecting: AtomicBool,
    session_listener: Mutex<Option<ListenerId>>,
    resource_listener: Mutex<Option<ListenerId>>,
    weak_self: Weak<NegotiationProtocolListener>,
}

impl NegotiationProtocolListener {
    pub fn new(
        transport: Arc<dyn Transport>,
        session_negotiations: Arc<NegotiationRegistry<SessionNegotiation>>,
        resource_negotiations: Arc<NegotiationRegistry<ResourceNegotiation>>,
        slot: Arc<SessionSlot>,
        handoff: Weak<dyn NegotiationHandoff>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            transport,
            session_negotiations,
            resource_negotiations,
            slot,
            handoff,
            rejecting: AtomicBool::new(false),
            session_listener: Mutex::new(None),
            resource_listener: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Start observing session-scoped negotiation traffic.
    pub fn attach(&self) {
        let mut listener = self.session_listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_none() {
            let weak = self.weak_self.clone();
            *listener = Some(self.transport.add_listener(
                negotiation_filter(NegotiationScope::Session),
                Arc::new(move |packet: Packet| {
                    if let Some(this) = weak.upgrade() {
                        this.handle_session_packet(packet);
                    }
                }),
            ));
        }
    }

    pub fn detach(&self) {
        self.detach_resource_listener();
        let listener = self.session_listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            self.transport.remove_listener(listener);
        }
    }

    pub fn is_rejecting(&self) -> bool {
        self.rejecting.load(Ordering::SeqCst)
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn is_observing_resources(&self) -> bool {
        self.resource_listener.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn attach_resource_listener(&self) {
        let mut listener = self.resource_listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_none() {
            let weak = self.weak_self.clone();
            *listener = Some(self.transport.add_listener(
                negotiation_filter(NegotiationScope::Resource),
                Arc::new(move |packet: Packet| {
                    if let Some(this) = weak.upgrade() {
                        this.handle_resource_packet(packet);
                    }
                }),
            ));
        }
    }

    fn detach_resource_listener(&self) {
        let listener = self.resource_listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            self.transport.remove_listener(listener);
        }
    }

    fn handle_session_packet(&self, packet: Packet) {
        let Message::Negotiation(message) = packet.message else {
            return;
        };
        let from = packet.from;

        match message {
            NegotiationMessage::SessionOffer {
                negotiation_id,
                protocol_version,
                session_id,
                description,
            } => {
                let offer =
                    SessionOffer { negotiation_id, protocol_version, session_id, description };
                self.session_offer(from, offer);
            }
            NegotiationMessage::SessionCancel { negotiation_id, error_message, code } => {
                match self.session_negotiations.get(&from, &negotiation_id) {
                    Some(negotiation) => negotiation.remote_cancel(error_message, code),
                    None => debug!(
                        peer = %from,
                        negotiation_id = %negotiation_id,
                        "cancel for a session negotiation that already terminated"
                    ),
                }
            }
            other => match self.session_negotiations.get(&from, other.negotiation_id()) {
                Some(negotiation) => negotiation.deliver(other),
                None => debug!(
                    peer = %from,
                    negotiation_id = %other.negotiation_id(),
                    kind = other.kind(),
                    "no session negotiation for message; dropping"
                ),
            },
        }
    }

    fn session_offer(&self, from: UserId, offer: SessionOffer) {
        let accepting = self
            .rejecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !accepting {
            info!(
                peer = %from,
                negotiation_id = %offer.negotiation_id,
                "refusing session offer: busy"
            );
            let reason = format!("{} is already in a session", self.transport.local_user());
            let cancel = NegotiationMessage::cancel(
                NegotiationScope::Session,
                offer.negotiation_id,
                Some(reason),
                CancelCode::Busy,
            );
            if let Err(error) = self.transport.send(&from, cancel.into()) {
                warn!(peer = %from, error = %error, "could not send busy refusal");
            }
            return;
        }

        let ack = NegotiationMessage::SessionAck { negotiation_id: offer.negotiation_id.clone() };
        if let Err(error) = self.transport.send(&from, ack.into()) {
            warn!(peer = %from, error = %error, "could not acknowledge session offer");
            self.set_rejecting(false);
            return;
        }

        let started = match self.handoff.upgrade() {
            Some(handoff) => handoff.session_offer_received(from, offer),
            None => false,
        };
        if !started {
            self.set_rejecting(false);
        }
    }

    fn handle_resource_packet(&self, packet: Packet) {
        let Message::Negotiation(message) = packet.message else {
            return;
        };
        let from = packet.from;

        match message {
            NegotiationMessage::ResourceOffer { negotiation_id, session_id, resources } => {
                if let Some(handoff) = self.handoff.upgrade() {
                    let offer = ResourceOffer { negotiation_id, session_id, resources };
                    handoff.resource_offer_received(from, offer);
                }
            }
            NegotiationMessage::ResourceCancel { negotiation_id, error_message, code } => {
                match self.resource_negotiations.get(&from, &negotiation_id) {
                    Some(negotiation) => negotiation.remote_cancel(error_message, code),
                    None => debug!(
                        peer = %from,
                        negotiation_id = %negotiation_id,
                        "cancel for a resource negotiation that already terminated"
                    ),
                }
            }
            other => match self.resource_negotiations.get(&from, other.negotiation_id()) {
                Some(negotiation) => negotiation.deliver(other),
                None => debug!(
                    peer = %from,
                    negotiation_id = %other.negotiation_id(),
                    kind = other.kind(),
                    "no resource negotiation for message; dropping"
                ),
            },
        }
    }
}

impl SessionLifecycleListener for NegotiationProtocolListener {
    fn session_starting(&self, _session: &Arc<Session>) {
        self.set_rejecting(true);
    }

    fn session_started(&self, _session: &Arc<Session>) {
        self.attach_resource_listener();
    }

    fn session_ended(&self, _session: &Arc<Session>, _reason: &SessionEndReason) {
        self.detach_resource_listener();
        self.set_rejecting(false);
    }

    fn negotiation_terminated(&self, report: &NegotiationReport) {
        let failed_join = report.scope == NegotiationScope::Session
            && report.outcome.is_err()
            && self.slot.current().is_none();
        if failed_join {
            self.set_rejecting(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tandem_common::protocol::version::CURRENT_PROTOCOL_VERSION;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::{LoopbackNetwork, LoopbackTransport};

    struct RecordingHandoff {
        start: bool,
        offers: Mutex<Vec<SessionOffer>>,
    }

    impl NegotiationHandoff for RecordingHandoff {
        fn session_offer_received(&self, _from: UserId, offer: SessionOffer) -> bool {
            self.offers.lock().unwrap().push(offer);
            self.start
        }

        fn resource_offer_received(&self, _from: UserId, _offer: ResourceOffer) {}
    }

    struct Fixture {
        listener: Arc<NegotiationProtocolListener>,
        handoff: Arc<RecordingHandoff>,
        peer: Arc<LoopbackTransport>,
        inbox: mpsc::UnboundedReceiver<NegotiationMessage>,
        _bob: Arc<LoopbackTransport>,
    }

    fn fixture(start: bool) -> Fixture {
        let network = LoopbackNetwork::new();
        let bob = network.connect("bob");
        let peer = network.connect("alice");
        let (tx, inbox) = mpsc::unbounded_channel();
        peer.add_listener(
            Arc::new(|_: &Packet| true),
            Arc::new(move |packet: Packet| {
                if let Message::Negotiation(message) = packet.message {
                    let _ = tx.send(message);
                }
            }),
        );

        let handoff = Arc::new(RecordingHandoff { start, offers: Mutex::new(Vec::new()) });
        let weak_handoff: Weak<dyn NegotiationHandoff> = Arc::<RecordingHandoff>::downgrade(&handoff);
        let listener = NegotiationProtocolListener::new(
            bob.clone(),
            Arc::new(NegotiationRegistry::new("session")),
            Arc::new(NegotiationRegistry::new("resource")),
            Arc::new(SessionSlot::new()),
            weak_handoff,
        );
        listener.attach();
        Fixture { listener, handoff, peer, inbox, _bob: bob }
    }

    fn offer(negotiation_id: &str) -> NegotiationMessage {
        NegotiationMessage::SessionOffer {
            negotiation_id: negotiation_id.into(),
            protocol_version: CURRENT_PROTOCOL_VERSION.into(),
            session_id: "S1".into(),
            description: "test".into(),
        }
    }

    async fn next(inbox: &mut mpsc::UnboundedReceiver<NegotiationMessage>) -> NegotiationMessage {
        tokio::time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .expect("message should arrive")
            .expect("inbox open")
    }

    #[tokio::test]
    async fn accepted_offer_is_acknowledged_and_handed_off() {
        let mut f = fixture(true);
        f.peer.send(&UserId::new("bob"), offer("n1").into()).unwrap();

        let ack = NegotiationMessage::SessionAck { negotiation_id: "n1".into() };
        assert_eq!(next(&mut f.inbox).await, ack);
        assert!(f.listener.is_rejecting());
        for _ in 0..100 {
            if !f.handoff.offers.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let offers = f.handoff.offers.lock().unwrap().clone();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].negotiation_id, "n1");
    }

    #[tokio::test]
    async fn offer_while_rejecting_gets_a_busy_cancel() {
        let mut f = fixture(true);
        f.listener.set_rejecting(true);
        f.peer.send(&UserId::new("bob"), offer("n1").into()).unwrap();

        match next(&mut f.inbox).await {
            NegotiationMessage::SessionCancel { negotiation_id, error_message, code } => {
                assert_eq!(negotiation_id, "n1");
                assert_eq!(code, CancelCode::Busy);
                assert!(error_message.is_some());
            }
            other => panic!("expected a busy cancel, got {other:?}"),
        }
        assert!(f.handoff.offers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unstarted_handoff_resets_the_rejecting_flag() {
        let mut f = fixture(false);
        f.peer.send(&UserId::new("bob"), offer("n1").into()).unwrap();

        assert!(matches!(next(&mut f.inbox).await, NegotiationMessage::SessionAck { .. }));
        for _ in 0..100 {
            if !f.listener.is_rejecting() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!f.listener.is_rejecting());
        assert_eq!(f.handoff.offers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resource_traffic_is_observed_only_while_a_session_runs() {
        let f = fixture(true);
        let session = Session::new("S1", UserId::new("bob"), UserId::new("bob"), Vec::new());
        assert!(!f.listener.is_observing_resources());

        f.listener.session_starting(&session);
        assert!(f.listener.is_rejecting());
        f.listener.session_started(&session);
        assert!(f.listener.is_observing_resources());

        f.listener.session_ended(&session, &SessionEndReason::Stopped);
        assert!(!f.listener.is_observing_resources());
        assert!(!f.listener.is_rejecting());
    }
}
