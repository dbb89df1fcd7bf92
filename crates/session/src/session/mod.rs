// The session aggregate: participants, shared resource groups and the
// activity execution entry point.
//
// `exec` is the single path by which activities are applied, whether fired
// locally or received from the network. Batches are applied one at a time
// in the order `exec` receives them; a batch submitted while another is
// being applied (including from inside a consumer) is appended and applied
// right after it by the task already executing.

mod state;
mod user;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use tandem_common::activity::{Activity, ResourcePath};
use tandem_common::types::{ColorId, Permission, UserId, UserInfo};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use user::User;

use self::state::SessionStateConsumer;
use crate::activity::{
    ActivityConsumer, ActivityDispatcher, ActivityListener, ActivityProducer, ActivityQueuer,
    ActivitySink, ConsumerPriority,
};
use crate::resources::ReferencePoint;
use crate::snapshot::{same_object, SnapshotList};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("resource group {group_id} is already mapped to {existing}")]
    GroupMapped { group_id: String, existing: ReferencePoint },

    #[error("reference point {reference_point} is already mapped to resource group {existing}")]
    ReferencePointMapped { reference_point: ReferencePoint, existing: String },
}

/// Which members of a reference point are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedScope {
    Complete,
    /// Explicit manifest keys; directories end with `/`.
    Partial(BTreeSet<String>),
}

impl SharedScope {
    pub fn from_partial(partial: Option<BTreeSet<String>>) -> Self {
        partial.map_or(Self::Complete, Self::Partial)
    }

    pub fn partial_paths(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Complete => None,
            Self::Partial(paths) => Some(paths),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        match self {
            Self::Complete => true,
            Self::Partial(paths) => paths.contains(path) || paths.contains(&format!("{path}/")),
        }
    }

    fn merge(self, other: SharedScope) -> SharedScope {
        match (self, other) {
            (Self::Partial(mut paths), Self::Partial(more)) => {
                paths.extend(more);
                Self::Partial(paths)
            }
            _ => Self::Complete,
        }
    }
}

/// Bijection between session-wide group ids and local reference points.
#[derive(Debug, Default)]
struct Mappings {
    by_group: HashMap<String, ReferencePoint>,
    by_reference_point: HashMap<ReferencePoint, String>,
}

#[derive(Default)]
struct Execution {
    pending: VecDeque<Vec<Activity>>,
    running: bool,
}

/// Routes activities created by registered producers into the session.
struct ProducerListener {
    session: Weak<Session>,
}

impl ActivityListener for ProducerListener {
    fn created(&self, activity: Activity) {
        if let Some(session) = self.session.upgrade() {
            session.fire_activity(activity);
        }
    }
}

pub struct Session {
    id: String,
    host: UserId,
    local: UserId,
    started_at: DateTime<Utc>,
    users: RwLock<Vec<User>>,
    mappings: RwLock<Mappings>,
    shared: RwLock<HashMap<ReferencePoint, SharedScope>>,
    dispatcher: ActivityDispatcher,
    queuer: ActivityQueuer,
    execution: Mutex<Execution>,
    sink: RwLock<Option<Arc<dyn ActivitySink>>>,
    producers: SnapshotList<Arc<dyn ActivityProducer>>,
    producer_listener: Arc<dyn ActivityListener>,
    stopped: AtomicBool,
}

impl Session {
    pub fn new(id: impl Into<String>, host: UserId, local: UserId, users: Vec<User>) -> Arc<Self> {
        let session = Arc::new_cyclic(|weak: &Weak<Session>| Self {
            id: id.into(),
            host,
            local,
            started_at: Utc::now(),
            users: RwLock::new(users),
            mappings: RwLock::new(Mappings::default()),
            shared: RwLock::new(HashMap::new()),
            dispatcher: ActivityDispatcher::new(),
            queuer: ActivityQueuer::new(),
            execution: Mutex::new(Execution::default()),
            sink: RwLock::new(None),
            producers: SnapshotList::new(),
            producer_listener: Arc::new(ProducerListener { session: weak.clone() }),
            stopped: AtomicBool::new(false),
        });
        let state = SessionStateConsumer::new(Arc::downgrade(&session));
        session.dispatcher.add_consumer(Arc::new(state), ConsumerPriority::Passive);
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &UserId {
        &self.host
    }

    pub fn local_user_id(&self) -> &UserId {
        &self.local
    }

    pub fn is_host(&self) -> bool {
        self.local == self.host
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // ── Users ───────────────────────────────────────────────────────

    pub fn users(&self) -> Vec<User> {
        self.users.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn user_infos(&self) -> Vec<UserInfo> {
        self.users.read().unwrap_or_else(PoisonError::into_inner).iter().map(User::info).collect()
    }

    pub fn remote_users(&self) -> Vec<User> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users.iter().filter(|user| !user.is_local).cloned().collect()
    }

    pub fn user(&self, id: &UserId) -> Option<User> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users.iter().find(|user| &user.id == id).cloned()
    }

    pub fn local_user(&self) -> Option<User> {
        self.user(&self.local)
    }

    pub fn has_user(&self, id: &UserId) -> bool {
        self.user(id).is_some()
    }

    pub fn has_write_access(&self, id: &UserId) -> bool {
        self.user(id).is_some_and(|user| user.has_write_access())
    }

    /// Returns false if a user with the same id is already a participant.
    pub fn add_user(&self, user: User) -> bool {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.iter().any(|existing| existing.id == user.id) {
            return false;
        }
        debug!(session_id = %self.id, user = %user.id, color = %user.color, "adding user");
        users.push(user);
        true
    }

    pub fn remove_user(&self, id: &UserId) -> Option<User> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let index = users.iter().position(|user| &user.id == id)?;
        Some(users.remove(index))
    }

    pub fn set_permission(&self, id: &UserId, permission: Permission) -> bool {
        self.update_user(id, |user| user.permission = permission)
    }

    pub fn set_color(&self, id: &UserId, color: ColorId) -> bool {
        self.update_user(id, |user| user.color = color)
    }

    pub fn set_resources_synced(&self, id: &UserId, synced: bool) -> bool {
        self.update_user(id, |user| user.resources_synced = synced)
    }

    fn update_user(&self, id: &UserId, update: impl FnOnce(&mut User)) -> bool {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        match users.iter_mut().find(|user| &user.id == id) {
            Some(user) => {
                update(user);
                true
            }
            None => false,
        }
    }

    // ── Resource groups ─────────────────────────────────────────────

    /// Map a session-wide group id to a local reference point. Re-adding the
    /// same pair is a no-op; anything that would break the bijection fails.
    pub fn add_reference_point_mapping(
        &self,
        group_id: &str,
        reference_point: ReferencePoint,
    ) -> Result<(), MappingError> {
        let mut mappings = self.mappings.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = mappings.by_group.get(group_id) {
            if existing == &reference_point {
                return Ok(());
            }
            return Err(MappingError::GroupMapped {
                group_id: group_id.to_string(),
                existing: existing.clone(),
            });
        }
        if let Some(existing) = mappings.by_reference_point.get(&reference_point) {
            return Err(MappingError::ReferencePointMapped {
                reference_point,
                existing: existing.clone(),
            });
        }
        debug!(session_id = %self.id, group_id, reference_point = %reference_point, "mapping added");
        mappings.by_reference_point.insert(reference_point.clone(), group_id.to_string());
        mappings.by_group.insert(group_id.to_string(), reference_point);
        Ok(())
    }

    pub fn remove_reference_point_mapping(&self, group_id: &str) -> Option<ReferencePoint> {
        let mut mappings = self.mappings.write().unwrap_or_else(PoisonError::into_inner);
        let reference_point = mappings.by_group.remove(group_id)?;
        mappings.by_reference_point.remove(&reference_point);
        Some(reference_point)
    }

    pub fn reference_point(&self, group_id: &str) -> Option<ReferencePoint> {
        let mappings = self.mappings.read().unwrap_or_else(PoisonError::into_inner);
        mappings.by_group.get(group_id).cloned()
    }

    pub fn group_id(&self, reference_point: &ReferencePoint) -> Option<String> {
        let mappings = self.mappings.read().unwrap_or_else(PoisonError::into_inner);
        mappings.by_reference_point.get(reference_point).cloned()
    }

    pub fn add_shared_resources(&self, reference_point: ReferencePoint, scope: SharedScope) {
        let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
        let merged = match shared.remove(&reference_point) {
            Some(existing) => existing.merge(scope),
            None => scope,
        };
        shared.insert(reference_point, merged);
    }

    pub fn remove_shared_resources(&self, reference_point: &ReferencePoint) -> bool {
        let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
        shared.remove(reference_point).is_some()
    }

    pub fn shared_scope(&self, reference_point: &ReferencePoint) -> Option<SharedScope> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner).get(reference_point).cloned()
    }

    /// Shared reference points with their group ids, ordered by group id.
    pub fn shared_groups(&self) -> Vec<(String, ReferencePoint, SharedScope)> {
        let shared = self.shared.read().unwrap_or_else(PoisonError::into_inner);
        let mut groups: Vec<_> = shared
            .iter()
            .filter_map(|(reference_point, scope)| {
                let group_id = self.group_id(reference_point)?;
                Some((group_id, reference_point.clone(), scope.clone()))
            })
            .collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        groups
    }

    pub fn is_completely_shared(&self, reference_point: &ReferencePoint) -> bool {
        matches!(self.shared_scope(reference_point), Some(SharedScope::Complete))
    }

    pub fn is_shared(&self, path: &ResourcePath) -> bool {
        let Some(reference_point) = self.reference_point(&path.group_id) else {
            return false;
        };
        self.shared_scope(&reference_point).is_some_and(|scope| scope.contains(&path.path))
    }

    // ── Queuing ─────────────────────────────────────────────────────

    /// Hold back resource activities for `group_id` until queuing is
    /// disabled. The group must be mapped before queuing is disabled or the
    /// held activities are dropped on release.
    pub fn enable_queuing(&self, group_id: &str) {
        if self.reference_point(group_id).is_none() {
            warn!(
                session_id = %self.id,
                group_id,
                "queuing enabled for an unmapped resource group; activities will be dropped"
            );
        }
        self.queuer.enable_queuing(group_id);
    }

    /// Release held activities for `group_id` in arrival order.
    pub fn disable_queuing(&self, group_id: &str) {
        let released = self.queuer.disable_queuing(group_id);
        if released > 0 {
            debug!(session_id = %self.id, group_id, released, "flushing queued activities");
        }
        self.exec(Vec::new());
    }

    pub fn is_queuing(&self, group_id: &str) -> bool {
        self.queuer.is_queuing(group_id)
    }

    // ── Consumers and producers ─────────────────────────────────────

    pub fn add_activity_consumer(
        &self,
        consumer: Arc<dyn ActivityConsumer>,
        priority: ConsumerPriority,
    ) {
        self.dispatcher.add_consumer(consumer, priority);
    }

    pub fn remove_activity_consumer(&self, consumer: &Arc<dyn ActivityConsumer>) -> bool {
        self.dispatcher.remove_consumer(consumer)
    }

    pub fn add_activity_producer(&self, producer: Arc<dyn ActivityProducer>) {
        let mut added = false;
        self.producers.update(|producers| {
            if !producers.iter().any(|existing| same_object(existing, &producer)) {
                producers.push(Arc::clone(&producer));
                added = true;
            }
        });
        if added {
            producer.add_activity_listener(Arc::clone(&self.producer_listener));
        }
    }

    pub fn remove_activity_producer(&self, producer: &Arc<dyn ActivityProducer>) {
        if self.producers.retain(|existing| !same_object(existing, producer)) > 0 {
            producer.remove_activity_listener(&self.producer_listener);
        }
    }

    pub(crate) fn set_activity_sink(&self, sink: Option<Arc<dyn ActivitySink>>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    // ── Execution ───────────────────────────────────────────────────

    /// Send a locally created activity to every remote participant, then
    /// apply it locally.
    pub fn fire_activity(&self, activity: Activity) {
        if self.is_stopped() {
            debug!(session_id = %self.id, kind = activity.kind(), "session stopped; dropping activity");
            return;
        }
        if matches!(activity, Activity::TextEdit { .. }) && !self.has_write_access(&self.local) {
            warn!(session_id = %self.id, "read-only participants cannot edit shared resources");
            return;
        }

        let recipients: Vec<UserId> = self.remote_users().into_iter().map(|user| user.id).collect();
        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let (Some(sink), false) = (sink, recipients.is_empty()) {
            sink.send_activities(&recipients, std::slice::from_ref(&activity));
        }
        self.exec(vec![activity]);
    }

    /// Activities received from `from` over the network.
    pub fn receive(&self, from: &UserId, activities: Vec<Activity>) {
        if !self.has_user(from) {
            debug!(session_id = %self.id, from = %from, "activities from a non-participant dropped");
            return;
        }
        let (genuine, forged): (Vec<_>, Vec<_>) =
            activities.into_iter().partition(|activity| activity.source() == from);
        if !forged.is_empty() {
            warn!(
                session_id = %self.id,
                from = %from,
                dropped = forged.len(),
                "dropping activities attributed to another participant"
            );
        }
        self.exec(genuine);
    }

    /// Apply a batch: queuing first, then fan-out of the eligible activities.
    pub fn exec(&self, activities: Vec<Activity>) {
        if self.is_stopped() {
            return;
        }
        {
            let mut execution = self.execution.lock().unwrap_or_else(PoisonError::into_inner);
            execution.pending.push_back(activities);
            if execution.running {
                return;
            }
            execution.running = true;
        }

        loop {
            let batch = {
                let mut execution = self.execution.lock().unwrap_or_else(PoisonError::into_inner);
                match execution.pending.pop_front() {
                    Some(batch) => batch,
                    None => {
                        execution.running = false;
                        return;
                    }
                }
            };
            for activity in self.queuer.process(batch) {
                if self.admissible(&activity) {
                    self.dispatcher.dispatch(&activity);
                }
            }
        }
    }

    fn admissible(&self, activity: &Activity) -> bool {
        let Some(path) = activity.resource_path() else {
            return true;
        };
        if self.reference_point(&path.group_id).is_none() {
            warn!(
                session_id = %self.id,
                path = %path,
                kind = activity.kind(),
                "dropping activity for an unmapped resource group"
            );
            return false;
        }
        let is_edit = matches!(activity, Activity::TextEdit { .. });
        if is_edit && !self.has_write_access(activity.source()) {
            warn!(
                session_id = %self.id,
                source = %activity.source(),
                path = %path,
                "dropping edit from a participant without write access"
            );
            return false;
        }
        true
    }

    /// Clear every registration. The session accepts no activities afterwards.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for producer in self.producers.snapshot().iter() {
            producer.remove_activity_listener(&self.producer_listener);
        }
        self.producers.clear();
        self.dispatcher.clear();
        self.queuer.clear();
        self.set_activity_sink(None);
        info!(session_id = %self.id, "session stopped");
    }
}
