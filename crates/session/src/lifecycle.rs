// Session lifecycle notifications.
//
// Listener callbacks run synchronously on whichever task performs the
// transition. A panicking listener is logged and skipped so it cannot abort
// the transition for everyone else.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tandem_common::protocol::negotiation::NegotiationScope;
use tandem_common::types::UserId;
use tracing::error;

use crate::negotiation::NegotiationError;
use crate::session::Session;
use crate::snapshot::{same_object, SnapshotList};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEndReason {
    /// The local user stopped the session.
    Stopped,
    /// The host left, which ends the session for everyone else.
    HostLeft,
    /// Joining failed after the session had already been created.
    JoinFailed(String),
}

impl fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("session stopped"),
            Self::HostLeft => f.write_str("host left the session"),
            Self::JoinFailed(reason) => write!(f, "joining the session failed: {reason}"),
        }
    }
}

/// Terminal outcome of one negotiation, reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationReport {
    pub scope: NegotiationScope,
    pub peer: UserId,
    pub negotiation_id: String,
    pub outcome: Result<(), NegotiationError>,
}

pub trait SessionLifecycleListener: Send + Sync {
    fn session_starting(&self, _session: &Arc<Session>) {}

    fn session_started(&self, _session: &Arc<Session>) {}

    fn session_ending(&self, _session: &Arc<Session>) {}

    fn session_ended(&self, _session: &Arc<Session>, _reason: &SessionEndReason) {}

    fn negotiation_terminated(&self, _report: &NegotiationReport) {}
}

#[derive(Default)]
pub struct LifecycleListeners {
    listeners: SnapshotList<Arc<dyn SessionLifecycleListener>>,
}

impl LifecycleListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn SessionLifecycleListener>) {
        self.listeners.update(|listeners| {
            if !listeners.iter().any(|existing| same_object(existing, &listener)) {
                listeners.push(listener);
            }
        });
    }

    pub fn remove(&self, listener: &Arc<dyn SessionLifecycleListener>) -> bool {
        self.listeners.retain(|existing| !same_object(existing, listener)) > 0
    }

    pub fn session_starting(&self, session: &Arc<Session>) {
        self.notify("session_starting", |listener| listener.session_starting(session));
    }

    pub fn session_started(&self, session: &Arc<Session>) {
        self.notify("session_started", |listener| listener.session_started(session));
    }

    pub fn session_ending(&self, session: &Arc<Session>) {
        self.notify("session_ending", |listener| listener.session_ending(session));
    }

    pub fn session_ended(&self, session: &Arc<Session>, reason: &SessionEndReason) {
        self.notify("session_ended", |listener| listener.session_ended(session, reason));
    }

    pub fn negotiation_terminated(&self, report: &NegotiationReport) {
        self.notify("negotiation_terminated", |listener| listener.negotiation_terminated(report));
    }

    fn notify(&self, callback: &'static str, call: impl Fn(&dyn SessionLifecycleListener)) {
        for listener in self.listeners.snapshot().iter() {
            guarded(callback, || call(listener.as_ref()));
        }
    }
}

/// Run a callback, logging instead of propagating a panic.
pub(crate) fn guarded(callback: &'static str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        error!(callback, "listener panicked; continuing with remaining listeners");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting(AtomicUsize);

    impl SessionLifecycleListener for Counting {
        fn negotiation_terminated(&self, _report: &NegotiationReport) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl SessionLifecycleListener for Panicking {
        fn negotiation_terminated(&self, _report: &NegotiationReport) {
            panic!("listener bug");
        }
    }

    fn report() -> NegotiationReport {
        NegotiationReport {
            scope: NegotiationScope::Session,
            peer: UserId::new("bob"),
            negotiation_id: "n1".into(),
            outcome: Ok(()),
        }
    }

    #[test]
    fn panicking_listener_does_not_stop_the_others() {
        let listeners = LifecycleListeners::new();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        listeners.add(Arc::new(Panicking));
        listeners.add(counting.clone());

        listeners.negotiation_terminated(&report());
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_are_registered_once() {
        let listeners = LifecycleListeners::new();
        let counting: Arc<dyn SessionLifecycleListener> = Arc::new(Counting(AtomicUsize::new(0)));
        listeners.add(counting.clone());
        listeners.add(counting.clone());
        assert_eq!(listeners.listeners.len(), 1);
        assert!(listeners.remove(&counting));
        assert!(!listeners.remove(&counting));
    }
}
