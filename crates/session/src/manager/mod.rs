// Session lifecycle coordinator.
//
// Owns the single session slot and everything that must follow a session's
// lifetime: the network activity bridge, the negotiation registries and the
// protocol listener's resource-scope subscription. Start and stop are
// serialized by the slot; negotiations run on spawned tasks and report back
// through the lifecycle listeners.

mod slot;

pub use slot::{SessionSlot, SlotError, SlotGuard};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tandem_common::activity::Activity;
use tandem_common::path::PathError;
use tandem_common::protocol::negotiation::{CancelCode, NegotiationMessage, NegotiationScope};
use tandem_common::types::{ColorId, Permission, UserId, UserInfo};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::activity::{ActivityConsumer, ConsumerPriority, NetworkActivityBridge};
use crate::config::SessionConfig;
use crate::lifecycle::{LifecycleListeners, SessionEndReason, SessionLifecycleListener};
use crate::negotiation::hooks::{default_hooks, Hooks, TransferType};
use crate::negotiation::listener::{
    NegotiationHandoff, NegotiationProtocolListener, ResourceOffer, SessionOffer,
};
use crate::negotiation::registry::{Negotiation, NegotiationRegistry};
use crate::negotiation::resource::ResourceNegotiation;
use crate::negotiation::session::{JoinRequest, SessionNegotiation};
use crate::negotiation::{
    CancelLocation, CancelNegotiation, Direction, NegotiationContext, NegotiationError,
    NegotiationTask, NegotiationTimeouts,
};
use crate::resources::{ReferencePoint, ResourceAccess};
use crate::session::{MappingError, Session, SharedScope, User};
use crate::transport::Transport;

const STOPPING_REASON: &str = "session is stopping";

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("no session is running")]
    NoSession,

    #[error("only the host can {0}")]
    NotHost(&'static str),

    #[error("{0} is already a participant")]
    AlreadyParticipant(UserId),

    #[error("{0} is not a participant")]
    UnknownUser(UserId),

    #[error("resource group {0} is not shared in this session")]
    UnknownGroup(String),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("color {0} is out of range")]
    InvalidColor(ColorId),

    #[error(transparent)]
    InvalidReferencePoint(#[from] PathError),
}

// ── Public types ───────────────────────────────────────────────────

/// A resource group offered when starting a session or added later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedResource {
    pub reference_point: ReferencePoint,
    pub scope: SharedScope,
}

impl SharedResource {
    pub fn complete(reference_point: ReferencePoint) -> Self {
        Self { reference_point, scope: SharedScope::Complete }
    }

    pub fn partial<I, P>(reference_point: ReferencePoint, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let paths: BTreeSet<String> = paths.into_iter().map(Into::into).collect();
        Self { reference_point, scope: SharedScope::Partial(paths) }
    }
}

/// Host-side result of an invitation: the admitted user, and whether the
/// initial resource transfer to them succeeded. A failed transfer leaves
/// the user in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteOutcome {
    pub user: UserInfo,
    pub resources: Result<(), NegotiationError>,
}

// ── In-flight tracking ─────────────────────────────────────────────

/// Counts spawned negotiation tasks so a stop can wait for them.
#[derive(Clone)]
struct InFlight(Arc<watch::Sender<usize>>);

struct InFlightGuard(Arc<watch::Sender<usize>>);

impl InFlight {
    fn new() -> Self {
        let (sender, _) = watch::channel(0);
        Self(Arc::new(sender))
    }

    fn enter(&self) -> InFlightGuard {
        self.0.send_modify(|count| *count += 1);
        InFlightGuard(Arc::clone(&self.0))
    }

    /// Returns false if tasks were still running when `timeout` elapsed.
    async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut receiver = self.0.subscribe();
        let idle = tokio::time::timeout(timeout, receiver.wait_for(|count| *count == 0)).await;
        matches!(idle, Ok(Ok(_)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Cancels whichever negotiation of an invitation is currently running.
struct InviteCanceller {
    session: Arc<SessionNegotiation>,
    resources: Mutex<Option<Arc<ResourceNegotiation>>>,
}

impl CancelNegotiation for InviteCanceller {
    fn local_cancel(&self, reason: Option<String>, notify_peer: bool) {
        self.session.local_cancel(reason.clone(), notify_peer);
        let resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(resources) = resources {
            resources.local_cancel(reason, notify_peer);
        }
    }
}

// ── Coordinator ────────────────────────────────────────────────────

pub struct SessionManager {
    local: UserId,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    resources: Arc<dyn ResourceAccess>,
    hooks: Hooks,
    context: NegotiationContext,
    slot: Arc<SessionSlot>,
    listeners: Arc<LifecycleListeners>,
    session_negotiations: Arc<NegotiationRegistry<SessionNegotiation>>,
    resource_negotiations: Arc<NegotiationRegistry<ResourceNegotiation>>,
    protocol: Arc<NegotiationProtocolListener>,
    bridge: Mutex<Option<Arc<NetworkActivityBridge>>>,
    transfer_types: Mutex<HashMap<UserId, TransferType>>,
    in_flight: InFlight,
    closing: AtomicBool,
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        resources: Arc<dyn ResourceAccess>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let hooks = default_hooks(ColorId::new(config.favorite_color), Some(config.transfer_type));
        Self::with_hooks(transport, resources, config, hooks)
    }

    pub fn with_hooks(
        transport: Arc<dyn Transport>,
        resources: Arc<dyn ResourceAccess>,
        config: SessionConfig,
        hooks: Hooks,
    ) -> Arc<Self> {
        let slot = Arc::new(SessionSlot::new());
        let listeners = Arc::new(LifecycleListeners::new());
        let session_negotiations = Arc::new(NegotiationRegistry::new("session"));
        let resource_negotiations = Arc::new(NegotiationRegistry::new("resource"));
        let context = NegotiationContext {
            transport: Arc::clone(&transport),
            listeners: Arc::clone(&listeners),
            timeouts: NegotiationTimeouts::from_config(&config),
        };

        let manager = Arc::new_cyclic(|weak_self: &Weak<SessionManager>| {
            let handoff: Weak<dyn NegotiationHandoff> = weak_self.clone();
            let protocol = NegotiationProtocolListener::new(
                Arc::clone(&transport),
                Arc::clone(&session_negotiations),
                Arc::clone(&resource_negotiations),
                Arc::clone(&slot),
                handoff,
            );
            Self {
                local: transport.local_user().clone(),
                config,
                transport,
                resources,
                hooks,
                context,
                slot,
                listeners,
                session_negotiations,
                resource_negotiations,
                protocol,
                bridge: Mutex::new(None),
                transfer_types: Mutex::new(HashMap::new()),
                in_flight: InFlight::new(),
                closing: AtomicBool::new(false),
                weak_self: weak_self.clone(),
            }
        });
        manager.listeners.add(manager.protocol.clone());
        manager.protocol.attach();
        manager
    }

    pub fn local_user(&self) -> &UserId {
        &self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn slot(&self) -> &Arc<SessionSlot> {
        &self.slot
    }

    /// The running session, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.slot.current()
    }

    pub fn protocol_listener(&self) -> &Arc<NegotiationProtocolListener> {
        &self.protocol
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn SessionLifecycleListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_lifecycle_listener(&self, listener: &Arc<dyn SessionLifecycleListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn session_negotiations(&self) -> Vec<Arc<SessionNegotiation>> {
        self.session_negotiations.list()
    }

    pub fn resource_negotiations(&self) -> Vec<Arc<ResourceNegotiation>> {
        self.resource_negotiations.list()
    }

    fn description(&self) -> String {
        match &self.config.display_name {
            Some(name) => format!("session hosted by {name}"),
            None => format!("session hosted by {}", self.local),
        }
    }

    // ── Start / stop ────────────────────────────────────────────────

    /// Start a session hosted by the local user, sharing `shared`.
    pub async fn start_session(
        &self,
        shared: Vec<SharedResource>,
    ) -> Result<Arc<Session>, SessionError> {
        let guard = self
            .slot
            .try_acquire_for_start(self.config.lock_timeout())
            .await
            .inspect_err(|error| warn!(error = %error, "could not start a session"))?;

        let color = ColorId::new(self.config.favorite_color);
        let host = UserInfo {
            id: self.local.clone(),
            permission: Permission::WriteAccess,
            color: if color.is_valid() { color } else { ColorId::new(0) },
            favorite_color: color,
        };
        let host = User::from_info(host, &self.local, &self.local);
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(session_id, self.local.clone(), self.local.clone(), vec![host]);
        for resource in shared {
            Self::share_locally(&session, resource)?;
        }

        self.listeners.session_starting(&session);
        self.activate(&session);
        guard.install(Arc::clone(&session));
        info!(
            session_id = %session.id(),
            groups = session.shared_groups().len(),
            "session started"
        );
        self.listeners.session_started(&session);
        Ok(session)
    }

    /// Stop the running session. In-flight negotiations are cancelled and
    /// given up to the stop timeout to wind down before teardown proceeds.
    pub async fn stop_session(&self, reason: SessionEndReason) -> Result<(), SessionError> {
        let (guard, session) = self
            .slot
            .try_acquire_for_stop(self.config.lock_timeout())
            .await
            .inspect_err(|error| warn!(error = %error, "could not stop the session"))?;
        self.closing.store(true, Ordering::SeqCst);

        if reason == SessionEndReason::Stopped {
            let local = self.local.clone();
            session.fire_activity(Activity::UserLeft { source: local.clone(), user: local });
        }
        self.listeners.session_ending(&session);

        self.cancel_negotiations();
        let timeout = self.config.stop_timeout();
        if !self.in_flight.wait_idle(timeout).await {
            warn!(
                session_id = %session.id(),
                timeout = ?timeout,
                "negotiations still running after the stop timeout; tearing down anyway"
            );
        }

        let bridge = self.bridge.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(bridge) = bridge {
            bridge.detach();
        }
        session.stop();
        guard.clear();
        self.transfer_types.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.closing.store(false, Ordering::SeqCst);

        info!(session_id = %session.id(), reason = %reason, "session ended");
        self.listeners.session_ended(&session, &reason);
        Ok(())
    }

    /// Stop the running session only if it is still `session_id`.
    async fn stop_if_current(&self, session_id: &str, reason: SessionEndReason) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let current = self.slot.current();
        if current.as_ref().map(|session| session.id()) != Some(session_id) {
            debug!(session_id, "session already replaced; nothing to stop");
            return;
        }
        if let Err(error) = self.stop_session(reason).await {
            warn!(session_id, error = %error, "failed to stop session");
        }
    }

    fn cancel_negotiations(&self) {
        for negotiation in self.session_negotiations.list() {
            negotiation.local_cancel(Some(STOPPING_REASON.into()), true);
        }
        for negotiation in self.resource_negotiations.list() {
            negotiation.local_cancel(Some(STOPPING_REASON.into()), true);
        }
    }

    /// Wire a freshly created session to the network and the coordinator.
    fn activate(&self, session: &Arc<Session>) {
        let bridge = NetworkActivityBridge::attach(Arc::clone(&self.transport), session);
        *self.bridge.lock().unwrap_or_else(PoisonError::into_inner) = Some(bridge);
        let watcher = HostDepartureWatcher {
            manager: self.weak_self.clone(),
            session: Arc::downgrade(session),
        };
        session.add_activity_consumer(Arc::new(watcher), ConsumerPriority::Active);
    }

    fn share_locally(session: &Session, resource: SharedResource) -> Result<String, SessionError> {
        let group_id = match session.group_id(&resource.reference_point) {
            Some(existing) => existing,
            None => {
                let group_id = uuid::Uuid::new_v4().to_string();
                session.add_reference_point_mapping(&group_id, resource.reference_point.clone())?;
                group_id
            }
        };
        session.add_shared_resources(resource.reference_point, resource.scope);
        Ok(group_id)
    }

    // ── Host operations ─────────────────────────────────────────────

    /// Invite `peer` into the running session. Once admitted, every shared
    /// resource group is transferred to it.
    pub fn invite(
        self: &Arc<Self>,
        peer: UserId,
    ) -> Result<NegotiationTask<InviteOutcome>, SessionError> {
        let session = self.session().ok_or(SessionError::NoSession)?;
        if !session.is_host() {
            return Err(SessionError::NotHost("invite participants"));
        }
        if peer == self.local || session.has_user(&peer) {
            return Err(SessionError::AlreadyParticipant(peer));
        }

        let negotiation_id = uuid::Uuid::new_v4().to_string();
        let negotiation = Arc::new(SessionNegotiation::outgoing(
            peer.clone(),
            negotiation_id.clone(),
            session.id().to_string(),
            self.description(),
            self.hooks.clone(),
            &self.context,
            Arc::clone(&self.session_negotiations),
        ));
        if !self.session_negotiations.add(Arc::clone(&negotiation)) {
            return Err(NegotiationError::Duplicate { peer, negotiation_id }.into());
        }
        info!(peer = %peer, negotiation_id = %negotiation_id, "inviting peer");

        let canceller = Arc::new(InviteCanceller {
            session: Arc::clone(&negotiation),
            resources: Mutex::new(None),
        });
        let manager = Arc::clone(self);
        let task_canceller = Arc::clone(&canceller);
        let guard = self.in_flight.enter();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let admission = negotiation.invite(Arc::clone(&session)).await?;
            let user = admission.user;
            manager
                .transfer_types
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(user.id.clone(), admission.parameters.transfer_type);
            session.fire_activity(Activity::UserJoined {
                source: manager.local.clone(),
                user: user.clone(),
            });

            let group_ids: Vec<String> =
                session.shared_groups().into_iter().map(|(group_id, _, _)| group_id).collect();
            let resources = if group_ids.is_empty() {
                session.set_resources_synced(&user.id, true);
                Ok(())
            } else {
                match manager.resource_negotiation(&session, &user.id) {
                    Ok(resources) => {
                        *task_canceller.resources.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(Arc::clone(&resources));
                        let transfer_type = admission.parameters.transfer_type;
                        resources.provide(session, group_ids, transfer_type).await
                    }
                    Err(error) => Err(error),
                }
            };
            Ok(InviteOutcome { user, resources })
        });
        Ok(NegotiationTask::new(peer, negotiation_id, handle, canceller))
    }

    /// Share additional resource groups with every current participant.
    pub fn add_resources(
        &self,
        shared: Vec<SharedResource>,
    ) -> Result<Vec<NegotiationTask<()>>, SessionError> {
        let session = self.session().ok_or(SessionError::NoSession)?;
        if !session.is_host() {
            return Err(SessionError::NotHost("add resources"));
        }
        let mut group_ids = Vec::with_capacity(shared.len());
        for resource in shared {
            group_ids.push(Self::share_locally(&session, resource)?);
        }
        info!(session_id = %session.id(), groups = group_ids.len(), "resources added");

        session
            .remote_users()
            .into_iter()
            .map(|user| self.share_resources_with(user.id, group_ids.clone()))
            .collect()
    }

    /// Transfer the given resource groups to one participant.
    pub fn share_resources_with(
        &self,
        peer: UserId,
        group_ids: Vec<String>,
    ) -> Result<NegotiationTask<()>, SessionError> {
        let session = self.session().ok_or(SessionError::NoSession)?;
        if peer == self.local || !session.has_user(&peer) {
            return Err(SessionError::UnknownUser(peer));
        }
        if let Some(unknown) = group_ids.iter().find(|id| session.reference_point(id).is_none()) {
            return Err(SessionError::UnknownGroup(unknown.clone()));
        }

        let negotiation = self.resource_negotiation(&session, &peer)?;
        let negotiation_id = negotiation.negotiation_id().to_string();
        let transfer_type = self.transfer_type_for(&peer);
        let task_negotiation = Arc::clone(&negotiation);
        let guard = self.in_flight.enter();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            task_negotiation.provide(session, group_ids, transfer_type).await
        });
        Ok(NegotiationTask::new(peer, negotiation_id, handle, negotiation))
    }

    /// Change the permission of a participant. Applied on every participant
    /// through the activity stream.
    pub fn change_permission(
        &self,
        user: &UserId,
        permission: Permission,
    ) -> Result<(), SessionError> {
        let session = self.session().ok_or(SessionError::NoSession)?;
        if !session.is_host() {
            return Err(SessionError::NotHost("change permissions"));
        }
        if !session.has_user(user) {
            return Err(SessionError::UnknownUser(user.clone()));
        }
        session.fire_activity(Activity::PermissionChange {
            source: self.local.clone(),
            affected: user.clone(),
            permission,
        });
        Ok(())
    }

    /// Change the local user's highlight color.
    pub fn change_color(&self, color: ColorId) -> Result<(), SessionError> {
        if !color.is_valid() {
            return Err(SessionError::InvalidColor(color));
        }
        let session = self.session().ok_or(SessionError::NoSession)?;
        session.fire_activity(Activity::ColorChange {
            source: self.local.clone(),
            affected: self.local.clone(),
            color,
        });
        Ok(())
    }

    fn transfer_type_for(&self, peer: &UserId) -> TransferType {
        self.transfer_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
            .unwrap_or(self.config.transfer_type)
    }

    /// Create and register an outgoing resource negotiation to `peer`.
    fn resource_negotiation(
        &self,
        session: &Session,
        peer: &UserId,
    ) -> Result<Arc<ResourceNegotiation>, NegotiationError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(NegotiationError::Cancelled {
                location: CancelLocation::Local,
                reason: Some(STOPPING_REASON.into()),
            });
        }
        let negotiation_id = uuid::Uuid::new_v4().to_string();
        let negotiation = Arc::new(ResourceNegotiation::new(
            Direction::Outgoing,
            peer.clone(),
            negotiation_id.clone(),
            session.id().to_string(),
            Arc::clone(&self.resources),
            &self.context,
            Arc::clone(&self.resource_negotiations),
        ));
        if !self.resource_negotiations.add(Arc::clone(&negotiation)) {
            return Err(NegotiationError::Duplicate { peer: peer.clone(), negotiation_id });
        }
        Ok(negotiation)
    }

    // ── Invitee ─────────────────────────────────────────────────────

    /// Create and install the local session described by the host.
    async fn join_session(&self, request: JoinRequest) -> Result<Arc<Session>, NegotiationError> {
        let guard = self
            .slot
            .try_acquire_for_start(self.config.lock_timeout())
            .await
            .map_err(|error| match error {
                SlotError::AlreadyActive => NegotiationError::Busy {
                    reason: format!("{} is already in a session", self.local),
                },
                SlotError::LockTimeout(_) => NegotiationError::Timeout("the session lock".into()),
                SlotError::NoSession => NegotiationError::Protocol(error.to_string()),
            })?;

        let users = request
            .users
            .into_iter()
            .map(|info| User::from_info(info, &request.host, &self.local))
            .collect();
        let session = Session::new(request.session_id, request.host, self.local.clone(), users);

        self.listeners.session_starting(&session);
        self.activate(&session);
        guard.install(Arc::clone(&session));
        info!(
            session_id = %session.id(),
            host = %session.host(),
            color = %request.parameters.color,
            "joined session"
        );
        self.listeners.session_started(&session);
        Ok(session)
    }

    fn refuse_resource_offer(&self, from: &UserId, negotiation_id: String, reason: String) {
        warn!(
            peer = %from,
            negotiation_id = %negotiation_id,
            reason = %reason,
            "refusing resource offer"
        );
        let cancel = NegotiationMessage::cancel(
            NegotiationScope::Resource,
            negotiation_id,
            Some(reason),
            CancelCode::Failed,
        );
        if let Err(error) = self.transport.send(from, cancel.into()) {
            warn!(peer = %from, error = %error, "could not refuse resource offer");
        }
    }
}

impl NegotiationHandoff for SessionManager {
    fn session_offer_received(&self, from: UserId, offer: SessionOffer) -> bool {
        let Some(manager) = self.weak_self.upgrade() else {
            return false;
        };
        let session_id = offer.session_id.clone();
        let negotiation = Arc::new(SessionNegotiation::incoming(
            from.clone(),
            offer.negotiation_id.clone(),
            offer.session_id,
            offer.description,
            self.hooks.clone(),
            &self.context,
            Arc::clone(&self.session_negotiations),
        ));
        let registered = self.session_negotiations.add(Arc::clone(&negotiation));
        debug_assert!(registered, "offers are refused while a session negotiation is registered");
        if !registered {
            return false;
        }
        info!(
            peer = %from,
            negotiation_id = %offer.negotiation_id,
            session_id = %session_id,
            "accepting session invitation"
        );

        let protocol_version = offer.protocol_version;
        let guard = self.in_flight.enter();
        tokio::spawn(async move {
            let joiner = Arc::clone(&manager);
            let result = negotiation
                .accept(protocol_version, move |request| async move {
                    joiner.join_session(request).await
                })
                .await;
            drop(guard);
            if let Err(error) = result {
                let reason = SessionEndReason::JoinFailed(error.to_string());
                manager.stop_if_current(&session_id, reason).await;
            }
        });
        true
    }

    fn resource_offer_received(&self, from: UserId, offer: ResourceOffer) {
        if self.closing.load(Ordering::SeqCst) {
            self.refuse_resource_offer(&from, offer.negotiation_id, STOPPING_REASON.into());
            return;
        }
        let session = match self.slot.current() {
            Some(session) if session.id() == offer.session_id && session.has_user(&from) => session,
            _ => {
                let reason = format!("{} is not in session {}", self.local, offer.session_id);
                self.refuse_resource_offer(&from, offer.negotiation_id, reason);
                return;
            }
        };

        let negotiation = Arc::new(ResourceNegotiation::new(
            Direction::Incoming,
            from,
            offer.negotiation_id,
            offer.session_id,
            Arc::clone(&self.resources),
            &self.context,
            Arc::clone(&self.resource_negotiations),
        ));
        if !self.resource_negotiations.add(Arc::clone(&negotiation)) {
            return;
        }
        // Queuing must be in place before the next inbound packet is handled.
        let prepared = negotiation.prepare(&session, offer.resources);
        let guard = self.in_flight.enter();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(error) = negotiation.request(session, prepared).await {
                debug!(error = %error, "resource negotiation ended without applying changes");
            }
        });
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.protocol.detach();
    }
}

// ── Host departure ─────────────────────────────────────────────────

/// Stops the local session once the host announces that it left.
struct HostDepartureWatcher {
    manager: Weak<SessionManager>,
    session: Weak<Session>,
}

impl ActivityConsumer for HostDepartureWatcher {
    fn exec(&self, activity: &Activity) {
        let Activity::UserLeft { user, .. } = activity else {
            return;
        };
        let (Some(manager), Some(session)) = (self.manager.upgrade(), self.session.upgrade())
        else {
            return;
        };
        if session.is_host() || user != session.host() {
            return;
        }

        info!(session_id = %session.id(), host = %user, "host left; stopping session");
        let session_id = session.id().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    manager.stop_if_current(&session_id, SessionEndReason::HostLeft).await;
                });
            }
            Err(error) => warn!(error = %error, "no runtime to stop the session on"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::MemoryResources;
    use crate::transport::LoopbackNetwork;

    fn manager(network: &LoopbackNetwork, user: &str) -> Arc<SessionManager> {
        SessionManager::new(
            network.connect(user),
            Arc::new(MemoryResources::new()),
            SessionConfig::default(),
        )
    }

    fn project() -> ReferencePoint {
        ReferencePoint::new("project").unwrap()
    }

    #[tokio::test]
    async fn start_and_stop_toggle_the_slot() {
        let network = LoopbackNetwork::new();
        let alice = manager(&network, "alice");

        let session = alice.start_session(vec![SharedResource::complete(project())]).await.unwrap();
        assert!(session.is_host());
        assert!(alice.protocol_listener().is_rejecting());
        assert!(alice.protocol_listener().is_observing_resources());
        assert!(session.is_completely_shared(&project()));

        alice.stop_session(SessionEndReason::Stopped).await.unwrap();
        assert!(alice.session().is_none());
        assert!(session.is_stopped());
        assert!(!alice.protocol_listener().is_rejecting());
        assert!(!alice.protocol_listener().is_observing_resources());
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let network = LoopbackNetwork::new();
        let alice = manager(&network, "alice");
        alice.start_session(Vec::new()).await.unwrap();

        let error = alice.start_session(Vec::new()).await.err().unwrap();
        assert!(matches!(error, SessionError::Slot(SlotError::AlreadyActive)));
    }

    #[tokio::test]
    async fn stop_without_session_is_refused() {
        let network = LoopbackNetwork::new();
        let alice = manager(&network, "alice");
        let error = alice.stop_session(SessionEndReason::Stopped).await.unwrap_err();
        assert!(matches!(error, SessionError::Slot(SlotError::NoSession)));
    }

    #[tokio::test]
    async fn host_operations_validate_their_arguments() {
        let network = LoopbackNetwork::new();
        let alice = manager(&network, "alice");
        assert!(matches!(alice.invite(UserId::new("bob")), Err(SessionError::NoSession)));

        alice.start_session(Vec::new()).await.unwrap();
        assert!(matches!(
            alice.invite(UserId::new("alice")),
            Err(SessionError::AlreadyParticipant(_))
        ));
        assert!(matches!(
            alice.change_permission(&UserId::new("carol"), Permission::ReadOnly),
            Err(SessionError::UnknownUser(_))
        ));
        assert!(matches!(
            alice.change_color(ColorId::new(42)),
            Err(SessionError::InvalidColor(_))
        ));
        assert!(matches!(
            alice.share_resources_with(UserId::new("carol"), Vec::new()),
            Err(SessionError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn change_color_applies_locally() {
        let network = LoopbackNetwork::new();
        let alice = manager(&network, "alice");
        let session = alice.start_session(Vec::new()).await.unwrap();

        alice.change_color(ColorId::new(3)).unwrap();
        assert_eq!(session.local_user().unwrap().color, ColorId::new(3));
    }

    #[tokio::test]
    async fn add_resources_maps_each_group_once() {
        let network = LoopbackNetwork::new();
        let alice = manager(&network, "alice");
        let session = alice.start_session(vec![SharedResource::complete(project())]).await.unwrap();

        let tasks = alice
            .add_resources(vec![SharedResource::partial(project(), ["a.txt"])])
            .unwrap();
        assert!(tasks.is_empty());
        assert_eq!(session.shared_groups().len(), 1);
        assert!(session.is_completely_shared(&project()));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_wait_times_out_while_tasks_run() {
        let in_flight = InFlight::new();
        let guard = in_flight.enter();
        assert!(!in_flight.wait_idle(Duration::from_millis(50)).await);
        drop(guard);
        assert!(in_flight.wait_idle(Duration::from_millis(50)).await);
    }
}
