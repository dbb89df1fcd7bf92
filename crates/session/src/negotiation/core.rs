// State and message plumbing shared by session and resource negotiations.
//
// Inbound control messages are pushed into the negotiation's inbox by the
// protocol listener; the negotiation task pulls them with a deadline. A
// cancel (local or remote) is broadcast on a watch channel so a task parked
// in `recv` wakes immediately.

use std::fmt;
use std::future::pending;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tandem_common::protocol::negotiation::{CancelCode, NegotiationMessage, NegotiationScope};
use tandem_common::types::UserId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::NegotiationError;
use crate::lifecycle::{LifecycleListeners, NegotiationReport};
use crate::transport::Transport;

/// States of a negotiation state machine.
pub trait NegotiationPhase: Copy + fmt::Debug + PartialEq + Send + Sync + 'static {
    const COMPLETED: Self;
    const CANCELLED: Self;
    const FAILED: Self;

    fn is_terminal(self) -> bool {
        self == Self::COMPLETED || self == Self::CANCELLED || self == Self::FAILED
    }
}

struct CoreState<S> {
    phase: S,
    outcome: Option<Result<(), NegotiationError>>,
}

pub(crate) struct NegotiationCore<S: NegotiationPhase> {
    id: String,
    peer: UserId,
    scope: NegotiationScope,
    transport: Arc<dyn Transport>,
    listeners: Arc<LifecycleListeners>,
    state: Mutex<CoreState<S>>,
    inbox_tx: mpsc::UnboundedSender<NegotiationMessage>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<NegotiationMessage>>,
    cancel: watch::Sender<Option<NegotiationError>>,
}

impl<S: NegotiationPhase> NegotiationCore<S> {
    pub(crate) fn new(
        scope: NegotiationScope,
        id: String,
        peer: UserId,
        initial: S,
        transport: Arc<dyn Transport>,
        listeners: Arc<LifecycleListeners>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(None);
        Self {
            id,
            peer,
            scope,
            transport,
            listeners,
            state: Mutex::new(CoreState { phase: initial, outcome: None }),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            cancel,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn peer(&self) -> &UserId {
        &self.peer
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn phase(&self) -> S {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).phase
    }

    /// Advance to a non-terminal phase; ignored once terminated.
    pub(crate) fn enter(&self, phase: S) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.outcome.is_none() {
            debug!(
                negotiation_id = %self.id,
                peer = %self.peer,
                from = ?state.phase,
                to = ?phase,
                "negotiation phase change"
            );
            state.phase = phase;
        }
    }

    pub(crate) fn outcome(&self) -> Option<Result<(), NegotiationError>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).outcome.clone()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.outcome().is_some()
    }

    /// Queue an inbound message for the negotiation task.
    pub(crate) fn deliver(&self, message: NegotiationMessage) {
        if self.inbox_tx.send(message).is_err() {
            debug!(negotiation_id = %self.id, "inbox closed; dropping message");
        }
    }

    pub(crate) fn send(&self, message: NegotiationMessage) -> Result<(), NegotiationError> {
        self.transport.send(&self.peer, message.into())?;
        Ok(())
    }

    /// Wait for the next inbound message, a cancel, or the deadline.
    pub(crate) async fn recv(
        &self,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> Result<NegotiationMessage, NegotiationError> {
        let mut cancel = self.cancel.subscribe();
        let mut inbox = self.inbox_rx.lock().await;
        tokio::select! {
            biased;
            error = cancelled(&mut cancel) => Err(error),
            message = inbox.recv() => message.ok_or_else(|| {
                NegotiationError::Protocol("negotiation inbox closed".into())
            }),
            _ = tokio::time::sleep(timeout) => Err(NegotiationError::Timeout(waiting_for.into())),
        }
    }

    /// Receive the next message and require it to be of the expected kind.
    pub(crate) async fn expect<T>(
        &self,
        timeout: Duration,
        waiting_for: &'static str,
        extract: impl FnOnce(NegotiationMessage) -> Result<T, NegotiationMessage>,
    ) -> Result<T, NegotiationError> {
        let message = self.recv(timeout, waiting_for).await?;
        extract(message).map_err(|unexpected| {
            NegotiationError::Protocol(format!(
                "expected {waiting_for}, received {}",
                unexpected.kind()
            ))
        })
    }

    /// Fail fast when the negotiation was cancelled between two steps.
    pub(crate) fn check_cancelled(&self) -> Result<(), NegotiationError> {
        match self.cancel.borrow().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Record the terminal outcome. Returns false if one was already recorded.
    ///
    /// On the first call the negotiation is deregistered via `deregister` and
    /// the outcome is reported to the lifecycle listeners.
    pub(crate) fn terminate(
        &self,
        outcome: Result<(), NegotiationError>,
        deregister: impl FnOnce(),
    ) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.outcome.is_some() {
                return false;
            }
            state.phase = match &outcome {
                Ok(()) => S::COMPLETED,
                Err(error) if error.is_cancellation() => S::CANCELLED,
                Err(_) => S::FAILED,
            };
            state.outcome = Some(outcome.clone());
        }

        match &outcome {
            Ok(()) => debug!(negotiation_id = %self.id, peer = %self.peer, "negotiation completed"),
            Err(error) => warn!(
                negotiation_id = %self.id,
                peer = %self.peer,
                error = %error,
                "negotiation terminated"
            ),
        }

        deregister();
        self.listeners.negotiation_terminated(&NegotiationReport {
            scope: self.scope,
            peer: self.peer.clone(),
            negotiation_id: self.id.clone(),
            outcome,
        });
        true
    }

    /// Terminate with `error`, wake the task and optionally tell the peer.
    /// A no-op once the negotiation has terminated.
    pub(crate) fn cancel(
        &self,
        error: NegotiationError,
        notify_peer: bool,
        deregister: impl FnOnce(),
    ) -> bool {
        if !self.terminate(Err(error.clone()), deregister) {
            return false;
        }
        let (reason, code) = (error.peer_reason(), error.cancel_code());
        self.cancel.send_replace(Some(error));
        if notify_peer {
            self.notify_peer(reason, code);
        }
        true
    }

    /// Terminate with the result of the negotiation task.
    ///
    /// If a cancel won the race, the recorded outcome is returned instead.
    pub(crate) fn finish<T>(
        &self,
        result: Result<T, NegotiationError>,
        deregister: impl FnOnce(),
    ) -> Result<T, NegotiationError> {
        match result {
            Ok(value) => {
                if self.terminate(Ok(()), deregister) {
                    Ok(value)
                } else {
                    Err(self.recorded_error())
                }
            }
            Err(error) => {
                if self.terminate(Err(error.clone()), deregister) {
                    self.cancel.send_replace(Some(error.clone()));
                    if error.should_notify_peer() {
                        self.notify_peer(error.peer_reason(), error.cancel_code());
                    }
                    Err(error)
                } else {
                    Err(self.recorded_error())
                }
            }
        }
    }

    fn recorded_error(&self) -> NegotiationError {
        match self.outcome() {
            Some(Err(error)) => error,
            _ => NegotiationError::Protocol("negotiation already completed".into()),
        }
    }

    /// Best-effort cancel message; failures are logged, never retried.
    pub(crate) fn notify_peer(&self, reason: Option<String>, code: CancelCode) {
        let message = NegotiationMessage::cancel(self.scope, self.id.clone(), reason, code);
        if let Err(error) = self.send(message) {
            warn!(
                negotiation_id = %self.id,
                peer = %self.peer,
                error = %error,
                "could not notify peer about cancellation"
            );
        }
    }
}

async fn cancelled(receiver: &mut watch::Receiver<Option<NegotiationError>>) -> NegotiationError {
    loop {
        let current = receiver.borrow_and_update().clone();
        if let Some(error) = current {
            return error;
        }
        if receiver.changed().await.is_err() {
            return pending().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tandem_common::protocol::packet::{Message, Packet};

    use super::*;
    use crate::lifecycle::SessionLifecycleListener;
    use crate::negotiation::CancelLocation;
    use crate::transport::LoopbackNetwork;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Phase {
        Running,
        Done,
        Cancelled,
        Failed,
    }

    impl NegotiationPhase for Phase {
        const COMPLETED: Self = Phase::Done;
        const CANCELLED: Self = Phase::Cancelled;
        const FAILED: Self = Phase::Failed;
    }

    #[derive(Default)]
    struct Reports(Mutex<Vec<NegotiationReport>>);

    impl SessionLifecycleListener for Reports {
        fn negotiation_terminated(&self, report: &NegotiationReport) {
            self.0.lock().unwrap().push(report.clone());
        }
    }

    fn core(network: &LoopbackNetwork, reports: &Arc<Reports>) -> NegotiationCore<Phase> {
        let listeners = Arc::new(LifecycleListeners::new());
        listeners.add(reports.clone());
        NegotiationCore::new(
            NegotiationScope::Session,
            "n1".into(),
            UserId::new("bob"),
            Phase::Running,
            network.connect("alice"),
            listeners,
        )
    }

    #[tokio::test]
    async fn terminal_transition_fires_exactly_once() {
        let network = LoopbackNetwork::new();
        let reports = Arc::new(Reports::default());
        let core = core(&network, &reports);
        let deregistered = AtomicUsize::new(0);
        let deregister = || {
            deregistered.fetch_add(1, Ordering::SeqCst);
        };

        let error = NegotiationError::Cancelled { location: CancelLocation::Local, reason: None };
        assert!(core.cancel(error.clone(), false, deregister));
        assert!(!core.cancel(error, false, deregister));
        assert!(core.finish(Ok(()), deregister).is_err());

        assert_eq!(deregistered.load(Ordering::SeqCst), 1);
        assert_eq!(reports.0.lock().unwrap().len(), 1);
        assert_eq!(core.phase(), Phase::Cancelled);
        assert!(core.is_terminated());
    }

    #[tokio::test]
    async fn cancel_wakes_a_pending_receive() {
        let network = LoopbackNetwork::new();
        let reports = Arc::new(Reports::default());
        let core = Arc::new(core(&network, &reports));

        let waiting = {
            let core = Arc::clone(&core);
            tokio::spawn(async move { core.recv(Duration::from_secs(60), "ack").await })
        };
        tokio::task::yield_now().await;
        let error = NegotiationError::Cancelled { location: CancelLocation::Remote, reason: None };
        core.cancel(error.clone(), false, || {});

        assert_eq!(waiting.await.unwrap(), Err(error));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out() {
        let network = LoopbackNetwork::new();
        let reports = Arc::new(Reports::default());
        let core = core(&network, &reports);

        let result = core.recv(Duration::from_millis(50), "session_ack").await;
        assert_eq!(result, Err(NegotiationError::Timeout("session_ack".into())));
    }

    #[tokio::test]
    async fn unexpected_message_is_a_protocol_error() {
        let network = LoopbackNetwork::new();
        let reports = Arc::new(Reports::default());
        let core = core(&network, &reports);
        core.deliver(NegotiationMessage::SessionJoined { negotiation_id: "n1".into() });

        let result = core
            .expect(Duration::from_secs(1), "session_ack", |message| match message {
                NegotiationMessage::SessionAck { .. } => Ok(()),
                other => Err(other),
            })
            .await;
        assert_eq!(
            result,
            Err(NegotiationError::Protocol(
                "expected session_ack, received session_joined".into()
            ))
        );
    }

    #[tokio::test]
    async fn failure_notifies_the_peer() {
        let network = LoopbackNetwork::new();
        let reports = Arc::new(Reports::default());
        let core = core(&network, &reports);
        let bob = network.connect("bob");
        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.add_listener(
            Arc::new(|_: &Packet| true),
            Arc::new(move |packet: Packet| {
                let _ = tx.send(packet.message);
            }),
        );

        let result: Result<(), _> =
            core.finish(Err(NegotiationError::Protocol("bad".into())), || {});
        assert!(result.is_err());

        let Some(Message::Negotiation(NegotiationMessage::SessionCancel { code, .. })) =
            rx.recv().await
        else {
            panic!("expected a session cancel");
        };
        assert_eq!(code, CancelCode::Failed);
        assert_eq!(core.phase(), Phase::Failed);
    }
}
