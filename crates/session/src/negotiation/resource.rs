// Resource negotiation: transfers the manifest and content of one or more
// shared resource groups to a participant and applies the minimal diff.
//
//   provider                                requester
//   ResourceOffer            ─────────────▶  (map groups, enable queuing)
//                            ◀─────────────  ResourceRequest
//   ResourceContent*         ─────────────▶
//   ResourceContentComplete  ─────────────▶  (manifest, deletions)
//                            ◀─────────────  ResourceCompleted
//
// Added directories are created before any content arrives. Local
// deletions happen only after the new manifest has been recorded; entries
// that change between file and directory are cleared right after that
// record, before the transfer, and everything else after it. The
// reference point keeps its incomplete marker until the diff is applied so
// an interrupted transfer can be retried as a whole.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tandem_common::filelist::{FileList, FileListDiff};
use tandem_common::protocol::negotiation::{
    CancelCode, FileContent, NegotiationMessage, NegotiationScope, RequestedFiles,
    ResourceNegotiationData,
};
use tandem_common::types::UserId;
use tracing::{debug, info, info_span, Instrument};

use super::core::{NegotiationCore, NegotiationPhase};
use super::hooks::TransferType;
use super::registry::{Negotiation, NegotiationRegistry};
use super::{CancelLocation, CancelNegotiation, Direction, NegotiationContext, NegotiationError};
use super::NegotiationTimeouts;
use crate::resources::{collect_file_list, sha256_hex, ReferencePoint, ResourceAccess};
use crate::session::{Session, SharedScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceNegotiationState {
    Created,
    SendingFileList,
    AwaitingFileList,
    ComputingDiff,
    TransferringContent,
    ApplyingDiff,
    Completed,
    Cancelled,
    Failed,
}

impl NegotiationPhase for ResourceNegotiationState {
    const COMPLETED: Self = Self::Completed;
    const CANCELLED: Self = Self::Cancelled;
    const FAILED: Self = Self::Failed;
}

/// An offered group after it was mapped to a local reference point.
#[derive(Debug, Clone)]
pub struct PreparedGroup {
    pub group_id: String,
    pub reference_point: ReferencePoint,
    pub file_list: FileList,
    pub scope: SharedScope,
    /// Whether the mapping was created for this negotiation.
    newly_mapped: bool,
}

struct GroupPlan<'a> {
    group: &'a PreparedGroup,
    diff: FileListDiff,
    outstanding: BTreeSet<String>,
    /// Removals already applied before the transfer.
    conflicting: BTreeSet<String>,
}

fn transfer_error(error: anyhow::Error) -> NegotiationError {
    NegotiationError::Transfer(format!("{error:#}"))
}

pub struct ResourceNegotiation {
    core: NegotiationCore<ResourceNegotiationState>,
    direction: Direction,
    session_id: String,
    resources: Arc<dyn ResourceAccess>,
    timeouts: NegotiationTimeouts,
    registry: Arc<NegotiationRegistry<ResourceNegotiation>>,
}

impl ResourceNegotiation {
    pub fn new(
        direction: Direction,
        peer: UserId,
        negotiation_id: String,
        session_id: String,
        resources: Arc<dyn ResourceAccess>,
        context: &NegotiationContext,
        registry: Arc<NegotiationRegistry<ResourceNegotiation>>,
    ) -> Self {
        let core = NegotiationCore::new(
            NegotiationScope::Resource,
            negotiation_id,
            peer,
            ResourceNegotiationState::Created,
            Arc::clone(&context.transport),
            Arc::clone(&context.listeners),
        );
        Self { core, direction, session_id, resources, timeouts: context.timeouts, registry }
    }

    pub fn state(&self) -> ResourceNegotiationState {
        self.core.phase()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }

    pub(crate) fn deliver(&self, message: NegotiationMessage) {
        self.core.deliver(message);
    }

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

    // ── Provider ────────────────────────────────────────────────────

    /// Offer `group_ids` of `session` to the peer and ship what it requests.
    pub async fn provide(
        &self,
        session: Arc<Session>,
        group_ids: Vec<String>,
        transfer_type: TransferType,
    ) -> Result<(), NegotiationError> {
        let span = info_span!(
            "tandem.negotiation.resource.provide",
            peer = %self.core.peer(),
            negotiation_id = %self.core.id(),
            groups = group_ids.len(),
            transfer = %transfer_type
        );
        let result =
            self.run_provide(&session, &group_ids, transfer_type).instrument(span).await;
        let result = self.core.finish(result, || self.deregister());
        if result.is_ok() {
            session.set_resources_synced(self.core.peer(), true);
            info!(peer = %self.core.peer(), groups = group_ids.len(), "resources shared");
        }
        result
    }

    async fn run_provide(
        &self,
        session: &Session,
        group_ids: &[String],
        transfer_type: TransferType,
    ) -> Result<(), NegotiationError> {
        let id = self.core.id().to_string();
        self.core.enter(ResourceNegotiationState::SendingFileList);

        let mut offered: BTreeMap<String, (ReferencePoint, FileList)> = BTreeMap::new();
        let mut offers = Vec::with_capacity(group_ids.len());
        for group_id in group_ids {
            let reference_point = session.reference_point(group_id).ok_or_else(|| {
                NegotiationError::Protocol(format!("resource group {group_id} is not mapped"))
            })?;
            let scope = session.shared_scope(&reference_point).unwrap_or(SharedScope::Complete);
            let complete = collect_file_list(self.resources.as_ref(), &reference_point)
                .map_err(transfer_error)?;
            let (file_list, partial) = match scope {
                SharedScope::Complete => (complete, None),
                SharedScope::Partial(paths) => (complete.restricted_to(&paths), Some(paths)),
            };
            offers.push(ResourceNegotiationData {
                group_id: group_id.clone(),
                group_name: reference_point.name().to_string(),
                file_list: file_list.clone(),
                partial,
            });
            offered.insert(group_id.clone(), (reference_point, file_list));
        }

        self.core.send(NegotiationMessage::ResourceOffer {
            negotiation_id: id.clone(),
            session_id: self.session_id.clone(),
            resources: offers,
        })?;
        let requested = self
            .core
            .expect(self.timeouts.response, "resource request", |message| match message {
                NegotiationMessage::ResourceRequest { requested, .. } => Ok(requested),
                other => Err(other),
            })
            .await?;

        self.core.enter(ResourceNegotiationState::TransferringContent);
        for RequestedFiles { group_id, paths } in requested {
            let (reference_point, file_list) = offered.get(&group_id).ok_or_else(|| {
                NegotiationError::Protocol(format!("requested group {group_id} was not offered"))
            })?;
            let mut archive = Vec::new();
            for path in paths {
                if file_list.checksum(&path).is_none() {
                    return Err(NegotiationError::Protocol(format!(
                        "requested file {path} was not offered"
                    )));
                }
                self.core.check_cancelled()?;
                let content = self
                    .resources
                    .read_file_content(reference_point, &path)
                    .map_err(transfer_error)?;
                let file = FileContent::new(path, &content);
                match transfer_type {
                    TransferType::Archive => archive.push(file),
                    TransferType::Instant => self.core.send(NegotiationMessage::ResourceContent {
                        negotiation_id: id.clone(),
                        group_id: group_id.clone(),
                        files: vec![file],
                    })?,
                }
            }
            if !archive.is_empty() {
                debug!(group_id = %group_id, files = archive.len(), "sending archive");
                self.core.send(NegotiationMessage::ResourceContent {
                    negotiation_id: id.clone(),
                    group_id,
                    files: archive,
                })?;
            }
        }
        self.core.send(NegotiationMessage::ResourceContentComplete { negotiation_id: id })?;

        self.core
            .expect(self.timeouts.response, "transfer confirmation", |message| match message {
                NegotiationMessage::ResourceCompleted { .. } => Ok(()),
                other => Err(other),
            })
            .await
    }

    // ── Requester ───────────────────────────────────────────────────

    /// Map every offered group to a local reference point and start queuing
    /// its activities. Runs synchronously while the offer is delivered so
    /// activities sent after the offer are already held back.
    pub fn prepare(
        &self,
        session: &Session,
        offered: Vec<ResourceNegotiationData>,
    ) -> Result<Vec<PreparedGroup>, NegotiationError> {
        self.core.enter(ResourceNegotiationState::AwaitingFileList);
        let mut prepared = Vec::with_capacity(offered.len());
        for data in offered {
            match Self::prepare_group(session, data) {
                Ok(group) => {
                    session.enable_queuing(&group.group_id);
                    prepared.push(group);
                }
                Err(error) => {
                    Self::rollback(session, &prepared);
                    return Err(error);
                }
            }
        }
        Ok(prepared)
    }

    fn prepare_group(
        session: &Session,
        data: ResourceNegotiationData,
    ) -> Result<PreparedGroup, NegotiationError> {
        let protocol = NegotiationError::Protocol;
        let group_id = data.group_id.clone();
        let file_list = data
            .file_list
            .validated()
            .map_err(|error| protocol(format!("invalid file list for {group_id}: {error}")))?;
        if let Some(partial) = &data.partial {
            if let Some(unknown) = partial.iter().find(|path| !file_list.contains(path)) {
                return Err(protocol(format!("shared path {unknown} is not in the file list")));
            }
        }

        let (reference_point, newly_mapped) = match session.reference_point(&data.group_id) {
            Some(existing) => (existing, false),
            None => {
                let reference_point = ReferencePoint::new(&data.group_name).map_err(|error| {
                    protocol(format!("invalid group name {}: {error}", data.group_name))
                })?;
                session
                    .add_reference_point_mapping(&data.group_id, reference_point.clone())
                    .map_err(|error| NegotiationError::Transfer(error.to_string()))?;
                (reference_point, true)
            }
        };

        Ok(PreparedGroup {
            group_id: data.group_id,
            reference_point,
            file_list,
            scope: SharedScope::from_partial(data.partial),
            newly_mapped,
        })
    }

    fn rollback(session: &Session, groups: &[PreparedGroup]) {
        for group in groups {
            if group.newly_mapped {
                session.remove_reference_point_mapping(&group.group_id);
            }
            session.disable_queuing(&group.group_id);
        }
    }

    /// Fetch and apply the offered groups. Queuing is released once the
    /// negotiation has terminated, whatever its outcome.
    pub async fn request(
        &self,
        session: Arc<Session>,
        prepared: Result<Vec<PreparedGroup>, NegotiationError>,
    ) -> Result<(), NegotiationError> {
        let span = info_span!(
            "tandem.negotiation.resource.request",
            peer = %self.core.peer(),
            negotiation_id = %self.core.id()
        );
        let groups = match &prepared {
            Ok(groups) => groups.as_slice(),
            Err(_) => &[],
        };
        let result = match &prepared {
            Ok(groups) => self.run_request(&session, groups).instrument(span).await,
            Err(error) => Err(error.clone()),
        };
        let result = self.core.finish(result, || self.deregister());

        match &result {
            Ok(()) => {
                for group in groups {
                    session.disable_queuing(&group.group_id);
                }
                info!(
                    peer = %self.core.peer(),
                    groups = groups.len(),
                    "shared resources received"
                );
            }
            Err(_) => Self::rollback(&session, groups),
        }
        result
    }

    async fn run_request(
        &self,
        session: &Session,
        groups: &[PreparedGroup],
    ) -> Result<(), NegotiationError> {
        let id = self.core.id().to_string();
        self.core.enter(ResourceNegotiationState::ComputingDiff);

        let mut plans: BTreeMap<&str, GroupPlan<'_>> = BTreeMap::new();
        let mut requested = Vec::with_capacity(groups.len());
        for group in groups {
            let reference_point = &group.reference_point;
            let local = collect_file_list(self.resources.as_ref(), reference_point)
                .map_err(transfer_error)?;
            let local = match &group.scope {
                SharedScope::Complete => local,
                SharedScope::Partial(paths) => local.restricted_to(paths),
            };
            let diff = local.diff(&group.file_list);
            debug!(
                group_id = %group.group_id,
                added = diff.added.len(),
                removed = diff.removed.len(),
                altered = diff.altered.len(),
                "computed resource diff"
            );

            self.resources.set_incomplete(reference_point, true).map_err(transfer_error)?;
            let conflicting: BTreeSet<String> =
                diff.conflicting_removals().into_iter().map(str::to_string).collect();
            if !conflicting.is_empty() {
                // Entries changing type are cleared before anything new is
                // materialized; the manifest is recorded first.
                self.resources
                    .write_manifest(reference_point, &group.file_list)
                    .map_err(transfer_error)?;
                for path in diff.removal_order().filter(|path| conflicting.contains(*path)) {
                    self.resources
                        .delete_resource(reference_point, path.trim_end_matches('/'))
                        .map_err(transfer_error)?;
                }
            }
            for directory in diff.added_directories() {
                self.resources
                    .create_directory(reference_point, directory.trim_end_matches('/'))
                    .map_err(transfer_error)?;
            }

            let outstanding = diff.files_to_fetch();
            requested.push(RequestedFiles {
                group_id: group.group_id.clone(),
                paths: outstanding.iter().cloned().collect(),
            });
            plans.insert(
                group.group_id.as_str(),
                GroupPlan { group, diff, outstanding, conflicting },
            );
        }

        self.core.enter(ResourceNegotiationState::TransferringContent);
        self.core.send(NegotiationMessage::ResourceRequest {
            negotiation_id: id.clone(),
            requested,
        })?;

        loop {
            let message = self.core.recv(self.timeouts.response, "resource content").await?;
            match message {
                NegotiationMessage::ResourceContent { group_id, files, .. } => {
                    let plan = plans.get_mut(group_id.as_str()).ok_or_else(|| {
                        NegotiationError::Protocol(format!("content for unknown group {group_id}"))
                    })?;
                    for file in files {
                        self.write_content(plan, file)?;
                    }
                }
                NegotiationMessage::ResourceContentComplete { .. } => break,
                other => {
                    return Err(NegotiationError::Protocol(format!(
                        "expected resource content, received {}",
                        other.kind()
                    )))
                }
            }
        }

        let missing: usize = plans.values().map(|plan| plan.outstanding.len()).sum();
        if missing > 0 {
            return Err(NegotiationError::Transfer(format!(
                "{missing} requested files were not delivered"
            )));
        }

        self.core.enter(ResourceNegotiationState::ApplyingDiff);
        for plan in plans.values() {
            let reference_point = &plan.group.reference_point;
            self.resources
                .write_manifest(reference_point, &plan.group.file_list)
                .map_err(transfer_error)?;
            let deferred =
                plan.diff.removal_order().filter(|path| !plan.conflicting.contains(*path));
            for path in deferred {
                self.resources
                    .delete_resource(reference_point, path.trim_end_matches('/'))
                    .map_err(transfer_error)?;
            }
            self.resources.set_incomplete(reference_point, false).map_err(transfer_error)?;
            session.add_shared_resources(reference_point.clone(), plan.group.scope.clone());
        }

        self.core.check_cancelled()?;
        self.core.send(NegotiationMessage::ResourceCompleted { negotiation_id: id })
    }

    fn write_content(
        &self,
        plan: &mut GroupPlan<'_>,
        file: FileContent,
    ) -> Result<(), NegotiationError> {
        let path = file.path.as_str();
        if !plan.outstanding.remove(path) {
            return Err(NegotiationError::Protocol(format!("received unrequested file {path}")));
        }
        let content = file.decode().map_err(|error| {
            NegotiationError::Protocol(format!("undecodable content for {path}: {error}"))
        })?;
        if plan.group.file_list.checksum(path) != Some(sha256_hex(&content).as_str()) {
            return Err(NegotiationError::Transfer(format!("checksum mismatch for {path}")));
        }
        self.resources
            .write_file_content(&plan.group.reference_point, path, &content)
            .map_err(transfer_error)
    }
}

impl Negotiation for ResourceNegotiation {
    fn peer(&self) -> &UserId {
        self.core.peer()
    }

    fn negotiation_id(&self) -> &str {
        self.core.id()
    }
}

impl CancelNegotiation for ResourceNegotiation {
    fn local_cancel(&self, reason: Option<String>, notify_peer: bool) {
        ResourceNegotiation::local_cancel(self, reason, notify_peer);
    }
}
