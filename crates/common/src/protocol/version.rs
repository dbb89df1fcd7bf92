// Negotiation protocol versions and the compatibility chart.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CURRENT_PROTOCOL_VERSION: &str = "2.1";

/// For each local version, the remote versions it can negotiate with.
pub const COMPATIBILITY_CHART: &[(&str, &[&str])] =
    &[("2.1", &["2.1", "2.0"]), ("2.0", &["2.0", "2.1"]), ("1.4", &["1.4"])];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("malformed protocol version '{0}'")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub fn parse(value: &str) -> Result<Self, VersionError> {
        let malformed = || VersionError::Malformed(value.to_string());
        let (major, minor) = value.trim().split_once('.').ok_or_else(malformed)?;
        Ok(Self {
            major: major.parse().map_err(|_| malformed())?,
            minor: minor.parse().map_err(|_| malformed())?,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outcome of comparing a remote protocol version against the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    Ok,
    /// The remote side runs an older, incompatible version.
    TooOld,
    /// The remote side runs a newer, incompatible version.
    TooNew,
}

impl Compatibility {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Check `remote` against `local` using the chart, falling back to an
/// ordering comparison to report which side is outdated.
pub fn check_compatibility(local: &str, remote: &str) -> Result<Compatibility, VersionError> {
    let local_version = ProtocolVersion::parse(local)?;
    let remote_version = ProtocolVersion::parse(remote)?;

    let charted = COMPATIBILITY_CHART
        .iter()
        .find(|(version, _)| is_version(version, local_version))
        .map(|(_, compatible)| compatible.iter().any(|v| is_version(v, remote_version)));

    if charted.unwrap_or(local_version == remote_version) {
        return Ok(Compatibility::Ok);
    }

    Ok(match remote_version.cmp(&local_version) {
        Ordering::Less => Compatibility::TooOld,
        Ordering::Greater => Compatibility::TooNew,
        Ordering::Equal => Compatibility::Ok,
    })
}

fn is_version(value: &str, version: ProtocolVersion) -> bool {
    ProtocolVersion::parse(value).ok() == Some(version)
}
