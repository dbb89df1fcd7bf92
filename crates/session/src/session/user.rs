// Session participants.

use chrono::{DateTime, Utc};
use tandem_common::types::{ColorId, Permission, UserId, UserInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub permission: Permission,
    pub color: ColorId,
    pub favorite_color: ColorId,
    pub is_host: bool,
    pub is_local: bool,
    /// Whether a resource negotiation to this user has completed.
    pub resources_synced: bool,
    pub joined_at: DateTime<Utc>,
}

impl User {
    pub fn from_info(info: UserInfo, host: &UserId, local: &UserId) -> Self {
        Self {
            is_host: &info.id == host,
            is_local: &info.id == local,
            resources_synced: &info.id == host,
            id: info.id,
            permission: info.permission,
            color: info.color,
            favorite_color: info.favorite_color,
            joined_at: Utc::now(),
        }
    }

    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id.clone(),
            permission: self.permission,
            color: self.color,
            favorite_color: self.favorite_color,
        }
    }

    pub fn has_write_access(&self) -> bool {
        self.permission == Permission::WriteAccess
    }
}
