// Core domain types shared by every session participant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Network address of a participant (a JID in XMPP deployments).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Number of distinct highlight colors handed out to participants.
pub const MAX_COLOR_ID: i32 = 5;

/// Highlight color slot of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColorId(i32);

impl ColorId {
    pub const UNDEFINED: ColorId = ColorId(-1);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 >= 0 && self.0 < MAX_COLOR_ID
    }

    /// Parse a color id carried as a hook preference value.
    pub fn parse(value: &str) -> Option<Self> {
        value.trim().parse::<i32>().ok().map(Self)
    }
}

impl Default for ColorId {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for ColorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Editing permission of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadOnly,
    WriteAccess,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::WriteAccess => "write_access",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable participant description exchanged during negotiation and
/// carried by user-joined activities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub permission: Permission,
    pub color: ColorId,
    pub favorite_color: ColorId,
}
