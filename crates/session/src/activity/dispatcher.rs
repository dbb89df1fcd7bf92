// Ordered fan-out of activities to registered consumers.
//
// Every consumer sees every dispatched activity exactly once, on the calling
// task, without an intermediate queue. Passive consumers (silent state
// bookkeeping) run before active ones (visible effects) so state is
// consistent before anything user-visible happens.

use std::sync::Arc;

use tandem_common::activity::Activity;
use tracing::trace;

use crate::lifecycle::guarded;
use crate::snapshot::{same_object, SnapshotList};

pub trait ActivityConsumer: Send + Sync {
    fn exec(&self, activity: &Activity);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConsumerPriority {
    /// Records state silently; always notified first.
    Passive,
    /// Performs a visible action.
    Active,
}

#[derive(Default)]
pub struct ActivityDispatcher {
    consumers: SnapshotList<(ConsumerPriority, Arc<dyn ActivityConsumer>)>,
}

impl ActivityDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer`; re-registering replaces the previous priority.
    pub fn add_consumer(&self, consumer: Arc<dyn ActivityConsumer>, priority: ConsumerPriority) {
        self.consumers.update(|consumers| {
            consumers.retain(|(_, existing)| !same_object(existing, &consumer));
            consumers.push((priority, consumer));
        });
    }

    pub fn remove_consumer(&self, consumer: &Arc<dyn ActivityConsumer>) -> bool {
        self.consumers.retain(|(_, existing)| !same_object(existing, consumer)) > 0
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn dispatch(&self, activity: &Activity) {
        let consumers = self.consumers.snapshot();
        trace!(kind = activity.kind(), consumers = consumers.len(), "dispatching activity");
        for priority in [ConsumerPriority::Passive, ConsumerPriority::Active] {
            for (_, consumer) in consumers.iter().filter(|(p, _)| *p == priority) {
                guarded("activity_consumer", || consumer.exec(activity));
            }
        }
    }

    pub fn clear(&self) {
        self.consumers.clear();
    }
}

// ── Producers ───────────────────────────────────────────────────────

/// Receives activities created by a producer.
pub trait ActivityListener: Send + Sync {
    fn created(&self, activity: Activity);
}

pub trait ActivityProducer: Send + Sync {
    fn add_activity_listener(&self, listener: Arc<dyn ActivityListener>);

    fn remove_activity_listener(&self, listener: &Arc<dyn ActivityListener>);
}

/// Producer that forwards every fired activity to its listeners.
#[derive(Default)]
pub struct BasicActivityProducer {
    listeners: SnapshotList<Arc<dyn ActivityListener>>,
}

impl BasicActivityProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self, activity: Activity) {
        for listener in self.listeners.snapshot().iter() {
            listener.created(activity.clone());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl ActivityProducer for BasicActivityProducer {
    fn add_activity_listener(&self, listener: Arc<dyn ActivityListener>) {
        self.listeners.update(|listeners| {
            if !listeners.iter().any(|existing| same_object(existing, &listener)) {
                listeners.push(listener);
            }
        });
    }

    fn remove_activity_listener(&self, listener: &Arc<dyn ActivityListener>) {
        self.listeners.retain(|existing| !same_object(existing, listener));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tandem_common::types::UserId;

    use super::*;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ActivityConsumer for Recorder {
        fn exec(&self, _activity: &Activity) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    fn left() -> Activity {
        Activity::UserLeft { source: UserId::new("bob"), user: UserId::new("bob") }
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder(name: &'static str, log: &Log) -> Arc<dyn ActivityConsumer> {
        Arc::new(Recorder { name, log: Arc::clone(log) })
    }

    #[test]
    fn passive_consumers_run_before_active_ones() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = ActivityDispatcher::new();
        dispatcher.add_consumer(recorder("visible", &log), ConsumerPriority::Active);
        dispatcher.add_consumer(recorder("silent-a", &log), ConsumerPriority::Passive);
        dispatcher.add_consumer(recorder("silent-b", &log), ConsumerPriority::Passive);

        dispatcher.dispatch(&left());
        assert_eq!(*log.lock().unwrap(), vec!["silent-a", "silent-b", "visible"]);
    }

    #[test]
    fn reregistering_replaces_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = ActivityDispatcher::new();
        let consumer = recorder("moved", &log);
        dispatcher.add_consumer(Arc::clone(&consumer), ConsumerPriority::Active);
        dispatcher.add_consumer(recorder("other", &log), ConsumerPriority::Passive);
        dispatcher.add_consumer(Arc::clone(&consumer), ConsumerPriority::Passive);

        dispatcher.dispatch(&left());
        assert_eq!(dispatcher.consumer_count(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["other", "moved"]);
    }

    #[test]
    fn removed_consumers_are_not_notified() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = ActivityDispatcher::new();
        let consumer = recorder("gone", &log);
        dispatcher.add_consumer(Arc::clone(&consumer), ConsumerPriority::Active);
        assert!(dispatcher.remove_consumer(&consumer));

        dispatcher.dispatch(&left());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn producer_forwards_to_listeners() {
        struct Collect(Mutex<Vec<Activity>>);
        impl ActivityListener for Collect {
            fn created(&self, activity: Activity) {
                self.0.lock().unwrap().push(activity);
            }
        }

        let producer = BasicActivityProducer::new();
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        let listener: Arc<dyn ActivityListener> = collect.clone();
        producer.add_activity_listener(Arc::clone(&listener));
        producer.add_activity_listener(Arc::clone(&listener));
        producer.fire(left());
        producer.remove_activity_listener(&listener);
        producer.fire(left());

        assert_eq!(collect.0.lock().unwrap().len(), 1);
    }
}
