use std::sync::{Arc, Mutex};
use std::time::Duration;

use tandem_common::activity::{Activity, ResourcePath};
use tandem_common::protocol::negotiation::NegotiationScope;
use tandem_common::types::{ColorId, Permission, UserId};
use tandem_session::activity::{ActivityConsumer, ConsumerPriority};
use tandem_session::config::SessionConfig;
use tandem_session::lifecycle::{NegotiationReport, SessionEndReason, SessionLifecycleListener};
use tandem_session::manager::{SessionManager, SharedResource};
use tandem_session::resources::{
    collect_file_list, MemoryResources, ReferencePoint, ResourceAccess,
};
use tandem_session::session::Session;
use tandem_session::transport::LoopbackNetwork;

#[tokio::test]
async fn invited_peer_receives_the_complete_manifest() {
    let network = LoopbackNetwork::new();
    let project = project();
    let (alice, alice_resources) = endpoint(&network, "alice");
    let (bob, bob_resources) = endpoint(&network, "bob");
    seed(&alice_resources, &project);

    let host_session = alice
        .start_session(vec![SharedResource::complete(project.clone())])
        .await
        .expect("session should start");

    let outcome = alice
        .invite(UserId::new("bob"))
        .expect("invite should start")
        .join()
        .await
        .expect("bob should join");
    assert_eq!(outcome.user.id, UserId::new("bob"));
    assert_eq!(outcome.user.color, ColorId::new(1), "alice already uses color 0");
    assert_eq!(outcome.resources, Ok(()));

    let expected = collect_file_list(alice_resources.as_ref(), &project).expect("host manifest");
    let received = bob_resources
        .read_manifest(&project)
        .expect("manifest readable")
        .expect("manifest recorded");
    assert_eq!(received, expected);
    assert_eq!(bob_resources.file_content(&project, "dir/b.txt"), Some(b"second".to_vec()));
    assert!(!bob_resources.is_incomplete(&project).expect("marker readable"));

    let guest_session = bob.session().expect("bob should be in a session");
    assert_eq!(guest_session.id(), host_session.id());
    assert_eq!(guest_session.host(), &UserId::new("alice"));
    assert!(guest_session.is_completely_shared(&project));
    let group_id = group_of(&host_session);
    eventually(|| !guest_session.is_queuing(&group_id)).await;
    assert!(bob.protocol_listener().is_rejecting());

    let bob_on_host = host_session.user(&UserId::new("bob")).expect("bob admitted on host");
    assert!(bob_on_host.resources_synced);
    assert!(alice.session_negotiations().is_empty());
    assert!(alice.resource_negotiations().is_empty());
}

#[tokio::test]
async fn partially_shared_group_transfers_only_the_selected_paths() {
    let network = LoopbackNetwork::new();
    let project = project();
    let (alice, alice_resources) = endpoint(&network, "alice");
    let (bob, bob_resources) = endpoint(&network, "bob");
    seed(&alice_resources, &project);

    let host_session = alice
        .start_session(vec![SharedResource::partial(project.clone(), ["dir/b.txt"])])
        .await
        .expect("session should start");
    let outcome = alice.invite(UserId::new("bob")).unwrap().join().await.unwrap();
    assert_eq!(outcome.resources, Ok(()));

    assert!(bob_resources.contains(&project, "dir/b.txt"));
    assert!(!bob_resources.contains(&project, "a.txt"));

    let guest_session = bob.session().unwrap();
    let group_id = group_of(&host_session);
    assert!(!guest_session.is_completely_shared(&project));
    assert!(guest_session.is_shared(&ResourcePath::new(group_id.clone(), "dir/b.txt")));
    assert!(!guest_session.is_shared(&ResourcePath::new(group_id, "a.txt")));
}

#[tokio::test]
async fn lifecycle_listeners_see_each_negotiation_once() {
    let network = LoopbackNetwork::new();
    let project = project();
    let (alice, alice_resources) = endpoint(&network, "alice");
    let (bob, _) = endpoint(&network, "bob");
    seed(&alice_resources, &project);
    let host_events = Recorder::attach(&alice);
    let guest_events = Recorder::attach(&bob);

    alice.start_session(vec![SharedResource::complete(project)]).await.unwrap();
    alice.invite(UserId::new("bob")).unwrap().join().await.unwrap();

    assert_eq!(
        host_events.snapshot(),
        vec!["starting", "started", "session negotiation ok", "resource negotiation ok"]
    );
    eventually(|| guest_events.snapshot().len() == 4).await;
    assert_eq!(
        guest_events.snapshot(),
        vec!["starting", "started", "session negotiation ok", "resource negotiation ok"]
    );
}

#[tokio::test]
async fn activities_reach_the_other_participant() {
    let network = LoopbackNetwork::new();
    let project = project();
    let (alice, alice_resources) = endpoint(&network, "alice");
    let (bob, _) = endpoint(&network, "bob");
    seed(&alice_resources, &project);

    let host_session =
        alice.start_session(vec![SharedResource::complete(project)]).await.unwrap();
    alice.invite(UserId::new("bob")).unwrap().join().await.unwrap();

    let seen = Arc::new(Collect::default());
    bob.session().unwrap().add_activity_consumer(seen.clone(), ConsumerPriority::Active);

    let edit = Activity::TextEdit {
        source: UserId::new("alice"),
        path: ResourcePath::new(group_of(&host_session), "a.txt"),
        offset: 0,
        text: "hello ".into(),
        replaced: String::new(),
    };
    host_session.fire_activity(edit.clone());

    eventually(|| seen.activities().contains(&edit)).await;
    assert_eq!(seen.activities().iter().filter(|activity| **activity == edit).count(), 1);
}

#[tokio::test]
async fn permission_change_is_applied_on_every_participant() {
    let network = LoopbackNetwork::new();
    let (alice, _) = endpoint(&network, "alice");
    let (bob, _) = endpoint(&network, "bob");
    let host_session = alice.start_session(Vec::new()).await.unwrap();
    alice.invite(UserId::new("bob")).unwrap().join().await.unwrap();

    let bob_id = UserId::new("bob");
    alice.change_permission(&bob_id, Permission::ReadOnly).expect("host may change permissions");
    assert!(!host_session.has_write_access(&bob_id));

    let guest_session = bob.session().unwrap();
    eventually(|| !guest_session.has_write_access(&bob_id)).await;

    let refused = bob.change_permission(&UserId::new("alice"), Permission::ReadOnly);
    assert!(refused.is_err(), "only the host may change permissions");
}

#[tokio::test]
async fn guest_leaving_is_announced_to_the_host() {
    let network = LoopbackNetwork::new();
    let (alice, _) = endpoint(&network, "alice");
    let (bob, _) = endpoint(&network, "bob");
    let host_session = alice.start_session(Vec::new()).await.unwrap();
    alice.invite(UserId::new("bob")).unwrap().join().await.unwrap();

    bob.stop_session(SessionEndReason::Stopped).await.expect("bob can leave");
    assert!(bob.session().is_none());
    assert!(!bob.protocol_listener().is_rejecting());

    eventually(|| !host_session.has_user(&UserId::new("bob"))).await;
    assert!(alice.session().is_some(), "the host keeps its session");
}

#[tokio::test]
async fn host_leaving_ends_the_session_for_guests() {
    let network = LoopbackNetwork::new();
    let (alice, _) = endpoint(&network, "alice");
    let (bob, _) = endpoint(&network, "bob");
    let guest_events = Recorder::attach(&bob);
    alice.start_session(Vec::new()).await.unwrap();
    alice.invite(UserId::new("bob")).unwrap().join().await.unwrap();

    alice.stop_session(SessionEndReason::Stopped).await.expect("host can stop");

    eventually(|| bob.session().is_none()).await;
    eventually(|| guest_events.snapshot().last().map(String::as_str) == Some("ended: host left"))
        .await;
}

#[tokio::test]
async fn resources_added_later_are_shared_with_participants() {
    let network = LoopbackNetwork::new();
    let project = project();
    let (alice, alice_resources) = endpoint(&network, "alice");
    let (bob, bob_resources) = endpoint(&network, "bob");
    seed(&alice_resources, &project);

    alice.start_session(Vec::new()).await.unwrap();
    let outcome = alice.invite(UserId::new("bob")).unwrap().join().await.unwrap();
    assert_eq!(outcome.resources, Ok(()));

    let tasks = alice
        .add_resources(vec![SharedResource::complete(project.clone())])
        .expect("host may add resources");
    assert_eq!(tasks.len(), 1);
    for task in tasks {
        task.join().await.expect("transfer should succeed");
    }

    assert_eq!(bob_resources.file_content(&project, "a.txt"), Some(b"first".to_vec()));
    assert!(bob.session().unwrap().is_completely_shared(&project));
}

// ── Helpers ────────────────────────────────────────────────────────

fn project() -> ReferencePoint {
    ReferencePoint::new("project").expect("valid reference point")
}

fn endpoint(network: &LoopbackNetwork, user: &str) -> (Arc<SessionManager>, Arc<MemoryResources>) {
    let resources = Arc::new(MemoryResources::new());
    let manager = SessionManager::new(network.connect(user), resources.clone(), config());
    (manager, resources)
}

fn config() -> SessionConfig {
    SessionConfig {
        ack_timeout_ms: 2_000,
        response_timeout_ms: 2_000,
        stop_timeout_ms: 1_000,
        ..SessionConfig::default()
    }
}

fn seed(resources: &MemoryResources, project: &ReferencePoint) {
    resources.insert_file(project, "a.txt", b"first").unwrap();
    resources.insert_file(project, "dir/b.txt", b"second").unwrap();
}

fn group_of(session: &Session) -> String {
    let groups = session.shared_groups();
    assert_eq!(groups.len(), 1, "exactly one shared group expected");
    groups[0].0.clone()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl Recorder {
    fn attach(manager: &SessionManager) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        manager.add_lifecycle_listener(recorder.clone());
        recorder
    }

    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl SessionLifecycleListener for Recorder {
    fn session_starting(&self, _session: &Arc<Session>) {
        self.push("starting".into());
    }

    fn session_started(&self, _session: &Arc<Session>) {
        self.push("started".into());
    }

    fn session_ended(&self, _session: &Arc<Session>, reason: &SessionEndReason) {
        self.push(format!("ended: {}", describe(reason)));
    }

    fn negotiation_terminated(&self, report: &NegotiationReport) {
        let scope = match report.scope {
            NegotiationScope::Session => "session",
            NegotiationScope::Resource => "resource",
        };
        let outcome = if report.outcome.is_ok() { "ok" } else { "failed" };
        self.push(format!("{scope} negotiation {outcome}"));
    }
}

fn describe(reason: &SessionEndReason) -> &'static str {
    match reason {
        SessionEndReason::Stopped => "stopped",
        SessionEndReason::HostLeft => "host left",
        SessionEndReason::JoinFailed(_) => "join failed",
    }
}

#[derive(Default)]
struct Collect(Mutex<Vec<Activity>>);

impl Collect {
    fn activities(&self) -> Vec<Activity> {
        self.0.lock().unwrap().clone()
    }
}

impl ActivityConsumer for Collect {
    fn exec(&self, activity: &Activity) {
        self.0.lock().unwrap().push(activity.clone());
    }
}
