// Buffering of resource activities whose group is not yet resolvable.
//
// While queuing is enabled for a group, its resource activities are held
// back in arrival order. Disabling moves the buffer to a flush queue that
// the next `process` call emits ahead of anything new. Session-wide
// activities are never delayed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use tandem_common::activity::Activity;
use tracing::debug;

#[derive(Default)]
struct QueuerState {
    /// Groups with queuing enabled, each with its pending activities.
    queues: HashMap<String, Vec<Activity>>,
    /// Released buffers waiting for the next `process` call.
    flushed: VecDeque<Activity>,
}

#[derive(Default)]
pub struct ActivityQueuer {
    state: Mutex<QueuerState>,
}

impl ActivityQueuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_queuing(&self, group_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queues.entry(group_id.to_string()).or_default();
        debug!(group_id, "activity queuing enabled");
    }

    /// Stop queuing for `group_id`; returns how many activities were released.
    pub fn disable_queuing(&self, group_id: &str) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(buffer) = state.queues.remove(group_id) else {
            return 0;
        };
        let released = buffer.len();
        state.flushed.extend(buffer);
        debug!(group_id, released, "activity queuing disabled");
        released
    }

    pub fn is_queuing(&self, group_id: &str) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).queues.contains_key(group_id)
    }

    pub fn queued(&self, group_id: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queues.get(group_id).map_or(0, Vec::len)
    }

    /// Split `activities` into those eligible for dispatch now (returned,
    /// preceded by any released buffers) and those that must wait.
    pub fn process(&self, activities: Vec<Activity>) -> Vec<Activity> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut eligible: Vec<Activity> = state.flushed.drain(..).collect();
        for activity in activities {
            let queue = activity
                .resource_path()
                .and_then(|path| state.queues.get_mut(&path.group_id));
            match queue {
                Some(queue) => queue.push(activity),
                None => eligible.push(activity),
            }
        }
        eligible
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queues.clear();
        state.flushed.clear();
    }
}

#[cfg(test)]
mod tests {
    use tandem_common::activity::{EditorAction, ResourcePath};
    use tandem_common::types::UserId;

    use super::*;

    fn opened(group: &str, path: &str) -> Activity {
        Activity::Editor {
            source: UserId::new("alice"),
            path: ResourcePath::new(group, path),
            action: EditorAction::Opened,
        }
    }

    fn left() -> Activity {
        Activity::UserLeft { source: UserId::new("bob"), user: UserId::new("bob") }
    }

    #[test]
    fn queued_group_is_held_back() {
        let queuer = ActivityQueuer::new();
        queuer.enable_queuing("G1");

        let eligible = queuer.process(vec![opened("G1", "a"), left(), opened("G2", "b")]);
        assert_eq!(eligible, vec![left(), opened("G2", "b")]);
        assert_eq!(queuer.queued("G1"), 1);
    }

    #[test]
    fn disabling_releases_in_arrival_order() {
        let queuer = ActivityQueuer::new();
        queuer.enable_queuing("G1");
        queuer.process(vec![opened("G1", "1")]);
        queuer.process(vec![opened("G1", "2"), opened("G1", "3")]);

        assert_eq!(queuer.disable_queuing("G1"), 3);
        assert!(!queuer.is_queuing("G1"));
        assert_eq!(
            queuer.process(Vec::new()),
            vec![opened("G1", "1"), opened("G1", "2"), opened("G1", "3")]
        );
        assert!(queuer.process(Vec::new()).is_empty());
    }

    #[test]
    fn released_activities_precede_new_ones() {
        let queuer = ActivityQueuer::new();
        queuer.enable_queuing("G1");
        queuer.process(vec![opened("G1", "old")]);
        queuer.disable_queuing("G1");

        let eligible = queuer.process(vec![opened("G1", "new")]);
        assert_eq!(eligible, vec![opened("G1", "old"), opened("G1", "new")]);
    }

    #[test]
    fn disabling_unknown_group_is_a_noop() {
        let queuer = ActivityQueuer::new();
        assert_eq!(queuer.disable_queuing("nope"), 0);
    }
}
