// Negotiations: bounded two-party protocol exchanges that admit a user into
// a session or transfer shared resources to one.
//
// Every negotiation instance terminates exactly once (completed, cancelled
// or failed). Termination removes it from its registry and is reported to
// the lifecycle listeners; failures never escape the negotiation task as
// panics.

pub mod core;
pub mod hooks;
pub mod listener;
pub mod registry;
pub mod resource;
pub mod session;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tandem_common::protocol::negotiation::CancelCode;
use tandem_common::protocol::version::Compatibility;
use tandem_common::types::UserId;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::lifecycle::LifecycleListeners;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelLocation {
    Local,
    Remote,
}

impl fmt::Display for CancelLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("locally"),
            Self::Remote => f.write_str("by the remote side"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("negotiation cancelled {location}{}", describe_reason(.reason))]
    Cancelled { location: CancelLocation, reason: Option<String> },

    #[error("the invitee is busy: {reason}")]
    Busy { reason: String },

    #[error("incompatible protocol versions (local {local}, remote {remote})")]
    VersionMismatch { local: String, remote: String, compatibility: Compatibility },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("could not reach the peer: {0}")]
    Transport(String),

    #[error("resource transfer failed: {0}")]
    Transfer(String),

    #[error("the remote side failed: {0}")]
    RemoteFailure(String),

    #[error("a negotiation with {peer} using id {negotiation_id} is already running")]
    Duplicate { peer: UserId, negotiation_id: String },
}

fn describe_reason(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}

impl From<TransportError> for NegotiationError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error.to_string())
    }
}

impl NegotiationError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Rebuild the typed failure announced by a remote cancel message.
    pub(crate) fn from_remote_cancel(code: CancelCode, reason: Option<String>) -> Self {
        match code {
            CancelCode::Cancelled => Self::Cancelled { location: CancelLocation::Remote, reason },
            CancelCode::Busy => {
                Self::Busy { reason: reason.unwrap_or_else(|| "already in a session".into()) }
            }
            CancelCode::VersionMismatch => Self::VersionMismatch {
                local: tandem_common::protocol::version::CURRENT_PROTOCOL_VERSION.into(),
                remote: reason.unwrap_or_else(|| "unknown".into()),
                compatibility: Compatibility::TooNew,
            },
            CancelCode::Failed => {
                Self::RemoteFailure(reason.unwrap_or_else(|| "unspecified error".into()))
            }
        }
    }

    /// Code to announce when this failure terminates the local side.
    pub(crate) fn cancel_code(&self) -> CancelCode {
        match self {
            Self::Cancelled { .. } => CancelCode::Cancelled,
            Self::Busy { .. } => CancelCode::Busy,
            Self::VersionMismatch { .. } => CancelCode::VersionMismatch,
            _ => CancelCode::Failed,
        }
    }

    /// Whether the peer still needs to hear about this failure. Only
    /// failures that originated on the remote side are already known there.
    pub(crate) fn should_notify_peer(&self) -> bool {
        match self {
            Self::Cancelled { location, .. } => *location == CancelLocation::Local,
            Self::RemoteFailure(_) | Self::Duplicate { .. } => false,
            Self::Busy { .. }
            | Self::VersionMismatch { .. }
            | Self::Timeout(_)
            | Self::Protocol(_)
            | Self::Transport(_)
            | Self::Transfer(_) => true,
        }
    }

    /// Reason text carried by the cancel message sent to the peer.
    pub(crate) fn peer_reason(&self) -> Option<String> {
        match self {
            Self::Cancelled { reason, .. } => reason.clone(),
            Self::VersionMismatch { local, .. } => Some(local.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Started locally (inviting / providing side).
    Outgoing,
    /// Started by the peer (invited / requesting side).
    Incoming,
}

/// Shared handles every negotiation needs.
#[derive(Clone)]
pub struct NegotiationContext {
    pub transport: Arc<dyn Transport>,
    pub listeners: Arc<LifecycleListeners>,
    pub timeouts: NegotiationTimeouts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationTimeouts {
    pub ack: Duration,
    pub response: Duration,
}

impl NegotiationTimeouts {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self { ack: config.ack_timeout(), response: config.response_timeout() }
    }
}

impl Default for NegotiationTimeouts {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Cooperative cancellation of a running negotiation.
pub trait CancelNegotiation: Send + Sync {
    fn local_cancel(&self, reason: Option<String>, notify_peer: bool);
}

/// Handle to a negotiation running on a background task.
pub struct NegotiationTask<T> {
    peer: UserId,
    negotiation_id: String,
    handle: JoinHandle<Result<T, NegotiationError>>,
    canceller: Arc<dyn CancelNegotiation>,
}

impl<T> NegotiationTask<T> {
    pub(crate) fn new(
        peer: UserId,
        negotiation_id: String,
        handle: JoinHandle<Result<T, NegotiationError>>,
        canceller: Arc<dyn CancelNegotiation>,
    ) -> Self {
        Self { peer, negotiation_id, handle, canceller }
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn negotiation_id(&self) -> &str {
        &self.negotiation_id
    }

    /// Cancel locally and tell the peer; a no-op once the negotiation ended.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.canceller.local_cancel(Some(reason.into()), true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<T, NegotiationError> {
        match self.handle.await {
            Ok(result) => result,
            Err(error) => {
                Err(NegotiationError::Protocol(format!("negotiation task aborted: {error}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_busy_is_not_a_cancellation() {
        let error =
            NegotiationError::from_remote_cancel(CancelCode::Busy, Some("in session".into()));
        assert_eq!(error, NegotiationError::Busy { reason: "in session".into() });
        assert!(!error.is_cancellation());
        assert_eq!(error.cancel_code(), CancelCode::Busy);
    }

    #[test]
    fn remote_cancel_is_a_cancellation() {
        let error = NegotiationError::from_remote_cancel(CancelCode::Cancelled, None);
        assert!(error.is_cancellation());
        assert_eq!(error.to_string(), "negotiation cancelled by the remote side");
    }

    #[test]
    fn local_cancel_reason_is_displayed() {
        let reason = Some("bye".into());
        let error = NegotiationError::Cancelled { location: CancelLocation::Local, reason };
        assert_eq!(error.to_string(), "negotiation cancelled locally: bye");
        assert!(error.should_notify_peer());
        assert_eq!(error.cancel_code(), CancelCode::Cancelled);
    }

    #[test]
    fn transfer_failures_are_announced_as_failed() {
        let error = NegotiationError::Transfer("disk full".into());
        assert_eq!(error.cancel_code(), CancelCode::Failed);
        assert_eq!(error.peer_reason().as_deref(), Some("resource transfer failed: disk full"));
    }
}
