// The single active-session slot.
//
// Reads are cheap and lock-free with respect to transitions. Start and stop
// serialize on a transition lock acquired with a timeout; a caller that
// cannot get it within the bound gives up instead of queuing.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::session::Session;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("timed out after {0:?} waiting for the session lock")]
    LockTimeout(Duration),

    #[error("a session is already running")]
    AlreadyActive,

    #[error("no session is running")]
    NoSession,
}

#[derive(Default)]
pub struct SessionSlot {
    current: RwLock<Option<Arc<Session>>>,
    transition: Mutex<()>,
}

/// Exclusive right to change the slot, held for one start or stop.
pub struct SlotGuard<'a> {
    slot: &'a SessionSlot,
    _transition: MutexGuard<'a, ()>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }

    async fn lock(&self, timeout: Duration) -> Result<SlotGuard<'_>, SlotError> {
        let transition = tokio::time::timeout(timeout, self.transition.lock())
            .await
            .map_err(|_| SlotError::LockTimeout(timeout))?;
        Ok(SlotGuard { slot: self, _transition: transition })
    }

    /// Acquire the slot for installing a new session; it must be empty.
    pub async fn try_acquire_for_start(
        &self,
        timeout: Duration,
    ) -> Result<SlotGuard<'_>, SlotError> {
        let guard = self.lock(timeout).await?;
        if self.is_active() {
            return Err(SlotError::AlreadyActive);
        }
        Ok(guard)
    }

    /// Acquire the slot for tearing down the running session.
    pub async fn try_acquire_for_stop(
        &self,
        timeout: Duration,
    ) -> Result<(SlotGuard<'_>, Arc<Session>), SlotError> {
        let guard = self.lock(timeout).await?;
        let session = self.current().ok_or(SlotError::NoSession)?;
        Ok((guard, session))
    }
}

impl SlotGuard<'_> {
    pub fn install(&self, session: Arc<Session>) {
        *self.slot.current.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    pub fn clear(&self) -> Option<Arc<Session>> {
        self.slot.current.write().unwrap_or_else(PoisonError::into_inner).take()
    }
}
