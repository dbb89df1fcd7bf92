// Session negotiation: admits exactly one remote peer into the session.
//
//   host                                   invitee
//   SessionOffer            ─────────────▶
//                           ◀─────────────  SessionAck (sent by the listener)
//                           ◀─────────────  ClientParameters
//   HostParameters          ─────────────▶
//                           ◀─────────────  SessionJoined
//   SessionJoinAcknowledged ─────────────▶
//
// The host adds the invitee to the session only after `SessionJoined`; if
// the final acknowledgment cannot be sent the user is removed again, so a
// failed negotiation never leaves partial membership behind.

use std::future::Future;
use std::sync::Arc;

use tandem_common::protocol::negotiation::{CancelCode, NegotiationMessage, NegotiationScope};
use tandem_common::protocol::version::{check_compatibility, CURRENT_PROTOCOL_VERSION};
use tandem_common::types::{Permission, UserId, UserInfo};
use tracing::{info, info_span, Instrument};

use super::core::{NegotiationCore, NegotiationPhase};
use super::hooks::{self, Hooks, JoinParameters};
use super::registry::{Negotiation, NegotiationRegistry};
use super::{CancelLocation, CancelNegotiation, Direction, NegotiationContext, NegotiationError};
use super::NegotiationTimeouts;
use crate::session::{Session, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNegotiationState {
    Initiated,
    WaitingForAck,
    ExchangingParameters,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl NegotiationPhase for SessionNegotiationState {
    const COMPLETED: Self = Self::Completed;
    const CANCELLED: Self = Self::Cancelled;
    const FAILED: Self = Self::Failed;
}

/// What the invitee needs to create its local session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub session_id: String,
    pub host: UserId,
    /// Every participant, the invitee included.
    pub users: Vec<UserInfo>,
    pub parameters: JoinParameters,
}

/// Result of a successful invitation on the host side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub user: UserInfo,
    pub parameters: JoinParameters,
}

pub struct SessionNegotiation {
    core: NegotiationCore<SessionNegotiationState>,
    direction: Direction,
    session_id: String,
    description: String,
    hooks: Hooks,
    timeouts: NegotiationTimeouts,
    registry: Arc<NegotiationRegistry<SessionNegotiation>>,
}

impl SessionNegotiation {
    /// Host side: invite `peer` into the session `session_id`.
    pub fn outgoing(
        peer: UserId,
        negotiation_id: String,
        session_id: String,
        description: String,
        hooks: Hooks,
        context: &NegotiationContext,
        registry: Arc<NegotiationRegistry<SessionNegotiation>>,
    ) -> Self {
        Self::new(
            Direction::Outgoing,
            peer,
            negotiation_id,
            session_id,
            description,
            hooks,
            context,
            registry,
        )
    }

    /// Invitee side, created after the offer has been acknowledged.
    pub fn incoming(
        peer: UserId,
        negotiation_id: String,
        session_id: String,
        description: String,
        hooks: Hooks,
        context: &NegotiationContext,
        registry: Arc<NegotiationRegistry<SessionNegotiation>>,
    ) -> Self {
        Self::new(
            Direction::Incoming,
            peer,
            negotiation_id,
            session_id,
            description,
            hooks,
            context,
            registry,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        direction: Direction,
        peer: UserId,
        negotiation_id: String,
        session_id: String,
        description: String,
        hooks: Hooks,
        context: &NegotiationContext,
        registry: Arc<NegotiationRegistry<SessionNegotiation>>,
    ) -> Self {
        let core = NegotiationCore::new(
            NegotiationScope::Session,
            negotiation_id,
            peer,
            SessionNegotiationState::Initiated,
            Arc::clone(&context.transport),
            Arc::clone(&context.listeners),
        );
        Self {
            core,
            direction,
            session_id,
            description,
            hooks,
            timeouts: context.timeouts,
            registry,
        }
    }

    pub fn state(&self) -> SessionNegotiationState {
        self.core.phase()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }

    /// Inbound message for this negotiation (cancels excluded).
    pub(crate) fn deliver(&self, message: NegotiationMessage) {
        self.core.deliver(message);
    }

    /// The peer cancelled; no cancel is sent back.
    pub fn remote_cancel(&self, reason: Option<String>, code: CancelCode) {
        let error = NegotiationError::from_remote_cancel(code, reason);
        self.core.cancel(error, false, || self.deregister());
    }

    pub fn local_cancel(&self, reason: Option<String>, notify_peer: bool) {
        let error = NegotiationError::Cancelled { location: CancelLocation::Local, reason };
        self.core.cancel(error, notify_peer, || self.deregister());
    }

    fn deregister(&self) {
        self.registry.remove(self.core.peer(), self.core.id());
    }

    // ── Host ────────────────────────────────────────────────────────

    /// Run the host side to completion. On success the peer is a member of
    /// `session`.
    pub async fn invite(&self, session: Arc<Session>) -> Result<Admission, NegotiationError> {
        let span = info_span!(
            "tandem.negotiation.session.invite",
            peer = %self.core.peer(),
            negotiation_id = %self.core.id(),
            session_id = %self.session_id
        );
        let result = self.run_invite(&session).instrument(span).await;
        let joined = result.is_ok();
        let result = self.core.finish(result, || self.deregister());
        if result.is_err() && joined {
            session.remove_user(self.core.peer());
        }
        if let Ok(admission) = &result {
            info!(
                peer = %admission.user.id,
                color = %admission.user.color,
                "peer joined the session"
            );
        }
        result
    }

    async fn run_invite(&self, session: &Session) -> Result<Admission, NegotiationError> {
        let id = self.core.id().to_string();
        let peer = self.core.peer().clone();

        self.core.enter(SessionNegotiationState::WaitingForAck);
        self.core.send(NegotiationMessage::SessionOffer {
            negotiation_id: id.clone(),
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            session_id: self.session_id.clone(),
            description: self.description.clone(),
        })?;
        self.core
            .expect(self.timeouts.ack, "session acknowledgment", |message| match message {
                NegotiationMessage::SessionAck { .. } => Ok(()),
                other => Err(other),
            })
            .await?;

        self.core.enter(SessionNegotiationState::ExchangingParameters);
        let client = self
            .core
            .expect(self.timeouts.response, "client parameters", |message| match message {
                NegotiationMessage::ClientParameters { parameters, .. } => Ok(parameters),
                other => Err(other),
            })
            .await?;

        let settings = hooks::consider_all(&self.hooks, session, &peer, &client);
        let mut parameters = JoinParameters::default();
        hooks::apply_all(&self.hooks, &settings, &mut parameters);
        let joining = UserInfo {
            id: peer.clone(),
            permission: Permission::WriteAccess,
            color: parameters.color,
            favorite_color: parameters.favorite_color,
        };
        let mut users = session.user_infos();
        users.push(joining.clone());
        self.core.send(NegotiationMessage::HostParameters {
            negotiation_id: id.clone(),
            users,
            parameters: settings,
        })?;

        self.core.enter(SessionNegotiationState::Finalizing);
        self.core
            .expect(self.timeouts.response, "join confirmation", |message| match message {
                NegotiationMessage::SessionJoined { .. } => Ok(()),
                other => Err(other),
            })
            .await?;
        self.core.check_cancelled()?;

        let user = User::from_info(joining.clone(), session.host(), session.local_user_id());
        if !session.add_user(user) {
            return Err(NegotiationError::Protocol(format!("{peer} is already a participant")));
        }
        if let Err(error) =
            self.core.send(NegotiationMessage::SessionJoinAcknowledged { negotiation_id: id })
        {
            session.remove_user(&peer);
            return Err(error);
        }

        Ok(Admission { user: joining, parameters })
    }

    // ── Invitee ─────────────────────────────────────────────────────

    /// Run the invitee side. `join` creates and installs the local session
    /// once the host's parameters are known; if anything fails afterwards
    /// the caller is responsible for tearing that session down again.
    pub async fn accept<F, Fut>(
        &self,
        remote_version: String,
        join: F,
    ) -> Result<Arc<Session>, NegotiationError>
    where
        F: FnOnce(JoinRequest) -> Fut + Send,
        Fut: Future<Output = Result<Arc<Session>, NegotiationError>> + Send,
    {
        let span = info_span!(
            "tandem.negotiation.session.accept",
            peer = %self.core.peer(),
            negotiation_id = %self.core.id(),
            session_id = %self.session_id
        );
        let result = self.run_accept(remote_version, join).instrument(span).await;
        self.core.finish(result, || self.deregister())
    }

    async fn run_accept<F, Fut>(
        &self,
        remote_version: String,
        join: F,
    ) -> Result<Arc<Session>, NegotiationError>
    where
        F: FnOnce(JoinRequest) -> Fut + Send,
        Fut: Future<Output = Result<Arc<Session>, NegotiationError>> + Send,
    {
        let id = self.core.id().to_string();
        let local = self.core.transport().local_user().clone();

        self.core.enter(SessionNegotiationState::ExchangingParameters);
        let compatibility = check_compatibility(CURRENT_PROTOCOL_VERSION, &remote_version)
            .map_err(|error| NegotiationError::Protocol(error.to_string()))?;
        if !compatibility.is_ok() {
            return Err(NegotiationError::VersionMismatch {
                local: CURRENT_PROTOCOL_VERSION.to_string(),
                remote: remote_version,
                compatibility,
            });
        }

        self.core.send(NegotiationMessage::ClientParameters {
            negotiation_id: id.clone(),
            parameters: hooks::collect_client_preferences(&self.hooks),
        })?;
        let (users, settings) = self
            .core
            .expect(self.timeouts.response, "host parameters", |message| match message {
                NegotiationMessage::HostParameters { users, parameters, .. } => {
                    Ok((users, parameters))
                }
                other => Err(other),
            })
            .await?;
        if !users.iter().any(|user| user.id == local) {
            return Err(NegotiationError::Protocol(
                "host parameters do not list the invitee".into(),
            ));
        }
        let mut parameters = JoinParameters::default();
        hooks::apply_all(&self.hooks, &settings, &mut parameters);

        self.core.enter(SessionNegotiationState::Finalizing);
        self.core.check_cancelled()?;
        let session = join(JoinRequest {
            session_id: self.session_id.clone(),
            host: self.core.peer().clone(),
            users,
            parameters,
        })
        .await?;

        self.core.send(NegotiationMessage::SessionJoined { negotiation_id: id })?;
        self.core
            .expect(self.timeouts.response, "join acknowledgment", |message| match message {
                NegotiationMessage::SessionJoinAcknowledged { .. } => Ok(()),
                other => Err(other),
            })
            .await?;
        Ok(session)
    }
}

impl Negotiation for SessionNegotiation {
    fn peer(&self) -> &UserId {
        self.core.peer()
    }

    fn negotiation_id(&self) -> &str {
        self.core.id()
    }
}

impl CancelNegotiation for SessionNegotiation {
    fn local_cancel(&self, reason: Option<String>, notify_peer: bool) {
        SessionNegotiation::local_cancel(self, reason, notify_peer);
    }
}
