// Negotiation control messages exchanged between inviter and invitee.
//
// Session negotiation:
//   host → SessionOffer, client → SessionAck, client → ClientParameters,
//   host → HostParameters, client → SessionJoined, host → SessionJoinAcknowledged
//
// Resource negotiation:
//   provider → ResourceOffer, requester → ResourceRequest,
//   provider → ResourceContent* + ResourceContentComplete, requester → ResourceCompleted
//
// Either side may send the matching cancel message at any point.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::filelist::FileList;
use crate::types::UserInfo;

/// Key/value preferences contributed or consumed by one negotiation hook.
pub type HookPreferences = BTreeMap<String, String>;

/// Preferences of every hook, keyed by hook identifier.
pub type HookParameters = BTreeMap<String, HookPreferences>;

/// Machine-readable reason attached to a cancel message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCode {
    #[default]
    Cancelled,
    /// The receiver is already in (or joining) a session.
    Busy,
    VersionMismatch,
    /// The sender hit an error it cannot recover from.
    Failed,
}

/// One resource group offered by the providing side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNegotiationData {
    pub group_id: String,
    pub group_name: String,
    pub file_list: FileList,
    /// Explicitly shared paths; `None` when the group is completely shared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedFiles {
    pub group_id: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content_b64: String,
}

impl FileContent {
    pub fn new(path: impl Into<String>, content: &[u8]) -> Self {
        Self { path: path.into(), content_b64: BASE64.encode(content) }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.content_b64)
    }
}

/// Which registry a negotiation message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationScope {
    Session,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NegotiationMessage {
    SessionOffer {
        negotiation_id: String,
        protocol_version: String,
        session_id: String,
        description: String,
    },

    SessionAck { negotiation_id: String },

    SessionCancel {
        negotiation_id: String,
        error_message: Option<String>,
        #[serde(default)]
        code: CancelCode,
    },

    ClientParameters { negotiation_id: String, parameters: HookParameters },

    /// Host-considered parameters plus the current participants (host included).
    HostParameters { negotiation_id: String, users: Vec<UserInfo>, parameters: HookParameters },

    SessionJoined { negotiation_id: String },

    SessionJoinAcknowledged { negotiation_id: String },

    ResourceOffer {
        negotiation_id: String,
        session_id: String,
        resources: Vec<ResourceNegotiationData>,
    },

    ResourceRequest { negotiation_id: String, requested: Vec<RequestedFiles> },

    ResourceContent { negotiation_id: String, group_id: String, files: Vec<FileContent> },

    ResourceContentComplete { negotiation_id: String },

    ResourceCompleted { negotiation_id: String },

    ResourceCancel {
        negotiation_id: String,
        error_message: Option<String>,
        #[serde(default)]
        code: CancelCode,
    },
}

impl NegotiationMessage {
    pub fn negotiation_id(&self) -> &str {
        match self {
            Self::SessionOffer { negotiation_id, .. }
            | Self::SessionAck { negotiation_id }
            | Self::SessionCancel { negotiation_id, .. }
            | Self::ClientParameters { negotiation_id, .. }
            | Self::HostParameters { negotiation_id, .. }
            | Self::SessionJoined { negotiation_id }
            | Self::SessionJoinAcknowledged { negotiation_id }
            | Self::ResourceOffer { negotiation_id, .. }
            | Self::ResourceRequest { negotiation_id, .. }
            | Self::ResourceContent { negotiation_id, .. }
            | Self::ResourceContentComplete { negotiation_id }
            | Self::ResourceCompleted { negotiation_id }
            | Self::ResourceCancel { negotiation_id, .. } => negotiation_id,
        }
    }

    pub fn scope(&self) -> NegotiationScope {
        match self {
            Self::SessionOffer { .. }
            | Self::SessionAck { .. }
            | Self::SessionCancel { .. }
            | Self::ClientParameters { .. }
            | Self::HostParameters { .. }
            | Self::SessionJoined { .. }
            | Self::SessionJoinAcknowledged { .. } => NegotiationScope::Session,
            Self::ResourceOffer { .. }
            | Self::ResourceRequest { .. }
            | Self::ResourceContent { .. }
            | Self::ResourceContentComplete { .. }
            | Self::ResourceCompleted { .. }
            | Self::ResourceCancel { .. } => NegotiationScope::Resource,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionOffer { .. } => "session_offer",
            Self::SessionAck { .. } => "session_ack",
            Self::SessionCancel { .. } => "session_cancel",
            Self::ClientParameters { .. } => "client_parameters",
            Self::HostParameters { .. } => "host_parameters",
            Self::SessionJoined { .. } => "session_joined",
            Self::SessionJoinAcknowledged { .. } => "session_join_acknowledged",
            Self::ResourceOffer { .. } => "resource_offer",
            Self::ResourceRequest { .. } => "resource_request",
            Self::ResourceContent { .. } => "resource_content",
            Self::ResourceContentComplete { .. } => "resource_content_complete",
            Self::ResourceCompleted { .. } => "resource_completed",
            Self::ResourceCancel { .. } => "resource_cancel",
        }
    }

    /// Build the cancel message matching `scope`.
    pub fn cancel(
        scope: NegotiationScope,
        negotiation_id: impl Into<String>,
        error_message: Option<String>,
        code: CancelCode,
    ) -> Self {
        let negotiation_id = negotiation_id.into();
        match scope {
            NegotiationScope::Session => {
                Self::SessionCancel { negotiation_id, error_message, code }
            }
            NegotiationScope::Resource => {
                Self::ResourceCancel { negotiation_id, error_message, code }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_code_defaults_when_absent() {
        let json = r#"{"type":"session_cancel","negotiation_id":"n1","error_message":null}"#;
        let message: NegotiationMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            message,
            NegotiationMessage::SessionCancel {
                negotiation_id: "n1".into(),
                error_message: None,
                code: CancelCode::Cancelled,
            }
        );
    }

    #[test]
    fn scope_and_id_are_reported() {
        let message = NegotiationMessage::ResourceContentComplete { negotiation_id: "r7".into() };
        assert_eq!(message.scope(), NegotiationScope::Resource);
        assert_eq!(message.negotiation_id(), "r7");
        assert_eq!(message.kind(), "resource_content_complete");
    }

    #[test]
    fn cancel_builder_matches_scope() {
        let session =
            NegotiationMessage::cancel(NegotiationScope::Session, "a", None, CancelCode::Busy);
        assert!(matches!(session, NegotiationMessage::SessionCancel { code: CancelCode::Busy, .. }));

        let reason = Some("io".to_string());
        let resource =
            NegotiationMessage::cancel(NegotiationScope::Resource, "b", reason, CancelCode::Failed);
        assert_eq!(resource.scope(), NegotiationScope::Resource);
    }

    #[test]
    fn file_content_survives_base64() {
        let content = FileContent::new("dir/b.txt", b"hello\x00world");
        assert_eq!(content.decode().unwrap(), b"hello\x00world");
    }

    #[test]
    fn wire_type_tags_are_snake_case() {
        let message = NegotiationMessage::SessionAck { negotiation_id: "n1".into() };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "session_ack");
    }
}
