// Activities: atomic, immutable units of session state change.
//
// Resource activities (text edits, editor events) carry a `ResourcePath`
// naming the resource group and the path inside it; everything else applies
// to the session as a whole.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ColorId, Permission, UserId, UserInfo};

/// Session-wide address of a resource: the agreed group id plus a path
/// relative to the group root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    pub group_id: String,
    pub path: String,
}

impl ResourcePath {
    pub fn new(group_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self { group_id: group_id.into(), path: path.into() }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditorAction {
    Opened,
    Closed,
    Saved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activity {
    /// Replace `replaced` at `offset` with `text` in a shared document.
    TextEdit {
        source: UserId,
        path: ResourcePath,
        offset: u32,
        text: String,
        replaced: String,
    },

    /// A participant opened, closed or saved a shared document.
    Editor { source: UserId, path: ResourcePath, action: EditorAction },

    PermissionChange { source: UserId, affected: UserId, permission: Permission },

    ColorChange { source: UserId, affected: UserId, color: ColorId },

    /// Announced by the host after a participant completed session negotiation.
    UserJoined { source: UserId, user: UserInfo },

    UserLeft { source: UserId, user: UserId },
}

impl Activity {
    pub fn source(&self) -> &UserId {
        match self {
            Self::TextEdit { source, .. }
            | Self::Editor { source, .. }
            | Self::PermissionChange { source, .. }
            | Self::ColorChange { source, .. }
            | Self::UserJoined { source, .. }
            | Self::UserLeft { source, .. } => source,
        }
    }

    /// Routing metadata for resource activities; `None` for session-wide ones.
    pub fn resource_path(&self) -> Option<&ResourcePath> {
        match self {
            Self::TextEdit { path, .. } | Self::Editor { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn is_resource_activity(&self) -> bool {
        self.resource_path().is_some()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextEdit { .. } => "text_edit",
            Self::Editor { .. } => "editor",
            Self::PermissionChange { .. } => "permission_change",
            Self::ColorChange { .. } => "color_change",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
        }
    }
}
