//! End-to-end scenarios driven through the event channels, the way an RM
//! shim talks to the core.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, timeout};

use canopy_cache::PartitionInfo;
use canopy_common::config::load_config;
use canopy_common::events::{
    AddApplication, Allocation, AllocationAsk, AllocationRelease, AllocationReleases, InboundEvent,
    NewNode, OutboundEvent, TerminationType, UpdateRequest,
};
use canopy_common::resources::Resource;
use canopy_common::security::UserGroup;
use canopy_scheduler::{Scheduler, SchedulerOptions};

const RM: &str = "rm-1";

fn fast_options() -> SchedulerOptions {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    SchedulerOptions {
        tick: Duration::from_millis(10),
        max_allocations: 16,
        cleaner_interval: Duration::from_millis(50),
    }
}

fn res(pairs: &[(&str, i64)]) -> Resource {
    Resource::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), *v)))
}

fn register_and_configure(tx: &UnboundedSender<InboundEvent>, yaml: &str) {
    tx.send(InboundEvent::RegisterResourceManager {
        rm_id: RM.to_string(),
        policy_group: "default".to_string(),
        version: "1.0".to_string(),
    })
    .unwrap();
    tx.send(InboundEvent::ConfigUpdate {
        rm_id: RM.to_string(),
        config: load_config(yaml).expect("test configuration must be valid"),
    })
    .unwrap();
}

fn node(id: &str, capacity: Resource) -> NewNode {
    NewNode {
        node_id: id.to_string(),
        attributes: HashMap::new(),
        capacity,
        existing_allocations: vec![],
    }
}

fn app(id: &str, queue: &str, user: &str, groups: &[&str]) -> AddApplication {
    AddApplication {
        application_id: id.to_string(),
        queue_name: queue.to_string(),
        partition_name: "default".to_string(),
        user: UserGroup::new(user, groups.iter().map(|g| g.to_string()).collect()),
        tags: HashMap::new(),
    }
}

fn ask(app_id: &str, key: &str, resource: Resource, repeats: i32) -> AllocationAsk {
    AllocationAsk {
        allocation_key: key.to_string(),
        application_id: app_id.to_string(),
        partition_name: "default".to_string(),
        queue_name: String::new(),
        resource,
        priority: 0,
        max_allocations: repeats,
        tags: HashMap::new(),
        placement_constraint: None,
    }
}

fn update(f: impl FnOnce(&mut UpdateRequest)) -> InboundEvent {
    let mut request = UpdateRequest {
        rm_id: RM.to_string(),
        ..UpdateRequest::default()
    };
    f(&mut request);
    InboundEvent::Update(request)
}

async fn next_event(rx: &mut UnboundedReceiver<OutboundEvent>) -> OutboundEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for outbound event")
        .expect("outbound channel closed")
}

/// Drain events until the predicate picks one.
async fn wait_for<F>(rx: &mut UnboundedReceiver<OutboundEvent>, pred: F) -> OutboundEvent
where
    F: Fn(&OutboundEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Poll a condition on the cache side until it holds.
async fn wait_until<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = Duration::from_secs(5);
    let result = timeout(deadline, async {
        while !cond() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

/// Structural invariants that must hold whenever the partition is idle:
/// the allocated totals of parents equal the sum over their children, leaf
/// totals equal the sum over their applications, and the application view
/// matches the node view.
fn assert_invariants(partition: &PartitionInfo) {
    fn check_queue(partition: &PartitionInfo, queue: &std::sync::Arc<canopy_cache::QueueInfo>) {
        let children = queue.children();
        let mut expected = Resource::new();
        if children.is_empty() {
            for app in partition.applications() {
                if app.queue_name() == queue.path() {
                    expected.add_to(&app.allocated_resource());
                }
            }
        } else {
            for child in &children {
                expected.add_to(&child.allocated_resource());
                check_queue(partition, child);
            }
        }
        assert_eq!(
            queue.allocated_resource(),
            expected,
            "allocated total of '{}' out of sync",
            queue.path()
        );
        if let Some(max) = queue.max_resource() {
            assert!(
                queue.allocated_resource().fits_in(&max),
                "queue '{}' exceeds its max",
                queue.path()
            );
        }
    }
    check_queue(partition, &partition.root());

    let mut by_apps = Resource::new();
    for app in partition.applications() {
        by_apps.add_to(&app.allocated_resource());
    }
    let mut by_nodes = Resource::new();
    for node in partition.nodes() {
        by_nodes.add_to(&node.allocated_resource());
    }
    assert_eq!(by_apps, by_nodes, "application and node views disagree");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_queue_single_ask() {
    let (scheduler, tx, mut rx) = Scheduler::start(fast_options());
    register_and_configure(
        &tx,
        r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
            resources:
              max: {memory: 1000, vcore: 10}
"#,
    );

    tx.send(update(|r| {
        r.new_nodes = vec![node("n1", res(&[("memory", 1000), ("vcore", 10)]))];
    }))
    .unwrap();
    let event = wait_for(&mut rx, |e| matches!(e, OutboundEvent::NodeUpdate { .. })).await;
    match event {
        OutboundEvent::NodeUpdate { accepted, rejected, .. } => {
            assert_eq!(accepted.len(), 1);
            assert!(rejected.is_empty());
        }
        _ => unreachable!(),
    }

    tx.send(update(|r| {
        r.new_applications = vec![app("app-1", "root.a", "alice", &[])];
    }))
    .unwrap();
    wait_for(
        &mut rx,
        |e| matches!(e, OutboundEvent::ApplicationUpdate { accepted, .. } if accepted.len() == 1),
    )
    .await;

    tx.send(update(|r| {
        r.asks = vec![ask("app-1", "ask-1", res(&[("memory", 500), ("vcore", 5)]), 1)];
    }))
    .unwrap();

    let event = wait_for(&mut rx, |e| matches!(e, OutboundEvent::NewAllocations { .. })).await;
    let allocation: Allocation = match event {
        OutboundEvent::NewAllocations { allocations, .. } => {
            assert_eq!(allocations.len(), 1);
            allocations[0].clone()
        }
        _ => unreachable!(),
    };
    assert_eq!(allocation.node_id, "n1");
    assert_eq!(allocation.queue_name, "root.a");
    assert_eq!(allocation.resource, res(&[("memory", 500), ("vcore", 5)]));

    let partition = scheduler.cluster().get_partition("default@rm-1").unwrap();
    let queue = partition.get_queue("root.a").unwrap();
    assert_eq!(queue.allocated_resource(), res(&[("memory", 500), ("vcore", 5)]));
    assert_invariants(&partition);

    // the round trip law: releasing the allocation restores the pre-submit
    // node and queue totals
    tx.send(update(|r| {
        r.releases = AllocationReleases {
            allocations: vec![AllocationRelease {
                partition_name: "default".to_string(),
                application_id: "app-1".to_string(),
                uuid: Some(allocation.uuid),
                message: "done".to_string(),
            }],
            asks: vec![],
        };
    }))
    .unwrap();
    let event = wait_for(&mut rx, |e| {
        matches!(e, OutboundEvent::ReleaseAllocations { .. })
    })
    .await;
    match event {
        OutboundEvent::ReleaseAllocations { releases, .. } => {
            assert_eq!(releases.len(), 1);
            assert_eq!(releases[0].termination_type, TerminationType::StoppedByRM);
        }
        _ => unreachable!(),
    }
    wait_until("queue drained", || queue.allocated_resource().is_zero()).await;
    let node_info = partition.get_node("n1").unwrap();
    assert_eq!(node_info.available_resource(), node_info.capacity());
    assert_invariants(&partition);
}

#[tokio::test(flavor = "multi_thread")]
async fn fair_share_between_sibling_queues() {
    let (scheduler, tx, _rx) = Scheduler::start(fast_options());
    register_and_configure(
        &tx,
        r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
            resources:
              guaranteed: {memory: 500}
          - name: b
            resources:
              guaranteed: {memory: 500}
"#,
    );

    tx.send(update(|r| {
        r.new_nodes = vec![node("n1", res(&[("memory", 1000)]))];
        r.new_applications = vec![
            app("app-a", "root.a", "alice", &[]),
            app("app-b", "root.b", "bob", &[]),
        ];
    }))
    .unwrap();
    tx.send(update(|r| {
        r.asks = vec![
            ask("app-a", "ask-a", res(&[("memory", 100)]), 10),
            ask("app-b", "ask-b", res(&[("memory", 100)]), 10),
        ];
    }))
    .unwrap();

    let partition_handle = scheduler.cluster();
    wait_until("cluster full", || {
        partition_handle
            .get_partition("default@rm-1")
            .map(|p| p.root().allocated_resource().get("memory") == 1000)
            .unwrap_or(false)
    })
    .await;

    let partition = scheduler.cluster().get_partition("default@rm-1").unwrap();
    let a = partition.get_queue("root.a").unwrap().allocated_resource();
    let b = partition.get_queue("root.b").unwrap().allocated_resource();
    // fair share within one allocation of granularity
    assert!((a.get("memory") - b.get("memory")).abs() <= 100, "a={a} b={b}");
    assert_invariants(&partition);
}

#[tokio::test(flavor = "multi_thread")]
async fn placement_user_rule_below_primary_group() {
    let (scheduler, tx, mut rx) = Scheduler::start(fast_options());
    register_and_configure(
        &tx,
        r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: dev
            parent: true
    placementrules:
      - name: User
        create: true
        parent:
          name: PrimaryGroup
          create: false
"#,
    );

    tx.send(update(|r| {
        r.new_applications = vec![app("app-1", "", "alice", &["dev"])];
    }))
    .unwrap();
    wait_for(
        &mut rx,
        |e| matches!(e, OutboundEvent::ApplicationUpdate { accepted, .. } if accepted.len() == 1),
    )
    .await;

    let partition = scheduler.cluster().get_partition("default@rm-1").unwrap();
    let queue = partition.get_queue("root.dev.alice").expect("queue created");
    assert!(queue.is_leaf());
    assert!(!queue.is_managed());
    assert_eq!(
        partition.get_application("app-1").unwrap().queue_name(),
        "root.dev.alice"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn acl_denies_submission() {
    let (scheduler, tx, mut rx) = Scheduler::start(fast_options());
    register_and_configure(
        &tx,
        r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: secure
            submitacl: "bob"
"#,
    );

    tx.send(update(|r| {
        r.new_applications = vec![app("app-1", "root.secure", "alice", &[])];
    }))
    .unwrap();
    let event = wait_for(&mut rx, |e| {
        matches!(e, OutboundEvent::ApplicationUpdate { .. })
    })
    .await;
    match event {
        OutboundEvent::ApplicationUpdate { accepted, rejected, .. } => {
            assert!(accepted.is_empty());
            assert_eq!(rejected.len(), 1);
            assert!(rejected[0].reason.contains("ACL"), "reason: {}", rejected[0].reason);
        }
        _ => unreachable!(),
    }
    let partition = scheduler.cluster().get_partition("default@rm-1").unwrap();
    assert!(partition.get_application("app-1").is_none());
    assert_eq!(partition.get_queue("root.secure").unwrap().application_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn preemption_reclaims_guaranteed_share() {
    let (scheduler, tx, mut rx) = Scheduler::start(fast_options());
    register_and_configure(
        &tx,
        r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: low
            resources:
              guaranteed: {memory: 100}
          - name: high
            resources:
              guaranteed: {memory: 800}
    preemption:
      enabled: true
"#,
    );

    tx.send(update(|r| {
        r.new_nodes = vec![node("n1", res(&[("memory", 900)]))];
        r.new_applications = vec![
            app("app-low", "root.low", "alice", &[]),
            app("app-high", "root.high", "bob", &[]),
        ];
    }))
    .unwrap();

    // fill the node: low 800, high 100
    tx.send(update(|r| {
        r.asks = vec![ask("app-low", "low-ask", res(&[("memory", 100)]), 8)];
    }))
    .unwrap();
    let cluster = scheduler.cluster();
    wait_until("low queue filled", || {
        cluster
            .get_partition("default@rm-1")
            .and_then(|p| p.get_queue("root.low"))
            .map(|q| q.allocated_resource().get("memory") == 800)
            .unwrap_or(false)
    })
    .await;
    tx.send(update(|r| {
        r.asks = vec![ask("app-high", "high-seed", res(&[("memory", 100)]), 1)];
    }))
    .unwrap();
    wait_until("high seeded", || {
        cluster
            .get_partition("default@rm-1")
            .and_then(|p| p.get_queue("root.high"))
            .map(|q| q.allocated_resource().get("memory") == 100)
            .unwrap_or(false)
    })
    .await;

    // the demanding ask that cannot fit without preemption
    tx.send(update(|r| {
        r.asks = vec![ask("app-high", "high-demand", res(&[("memory", 500)]), 1)];
    }))
    .unwrap();

    let event = wait_for(&mut rx, |e| {
        matches!(e, OutboundEvent::ReleaseAllocations { releases, .. }
            if releases.iter().any(|r| r.termination_type == TerminationType::PreemptedByScheduler))
    })
    .await;
    let preempted_total: i64 = match event {
        OutboundEvent::ReleaseAllocations { releases, .. } => {
            assert!(releases
                .iter()
                .all(|r| r.application_id == "app-low"
                    && r.termination_type == TerminationType::PreemptedByScheduler));
            releases.len() as i64 * 100
        }
        _ => unreachable!(),
    };
    assert!(preempted_total >= 500, "released only {preempted_total}");

    let event = wait_for(&mut rx, |e| {
        matches!(e, OutboundEvent::NewAllocations { allocations, .. }
            if allocations.iter().any(|a| a.allocation_key == "high-demand"))
    })
    .await;
    match event {
        OutboundEvent::NewAllocations { allocations, .. } => {
            assert_eq!(allocations[0].queue_name, "root.high");
            assert_eq!(allocations[0].resource, res(&[("memory", 500)]));
        }
        _ => unreachable!(),
    }

    let partition = scheduler.cluster().get_partition("default@rm-1").unwrap();
    wait_until("high got its share", || {
        partition
            .get_queue("root.high")
            .map(|q| q.allocated_resource().get("memory") == 600)
            .unwrap_or(false)
    })
    .await;
    assert_invariants(&partition);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_config_is_rejected_and_previous_retained() {
    let (scheduler, tx, mut rx) = Scheduler::start(fast_options());
    register_and_configure(
        &tx,
        r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
"#,
    );
    tx.send(update(|r| {
        r.new_applications = vec![app("app-1", "root.a", "alice", &[])];
    }))
    .unwrap();
    wait_for(
        &mut rx,
        |e| matches!(e, OutboundEvent::ApplicationUpdate { accepted, .. } if accepted.len() == 1),
    )
    .await;

    // duplicate sibling names never make it past loading
    let invalid = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: test
          - name: test
"#;
    assert!(load_config(invalid).is_err());

    // the partition built from the first snapshot is still serving
    let partition = scheduler.cluster().get_partition("default@rm-1").unwrap();
    assert!(partition.get_queue("root.a").unwrap().is_running());
    tx.send(update(|r| {
        r.new_applications = vec![app("app-2", "root.a", "bob", &[])];
    }))
    .unwrap();
    wait_for(
        &mut rx,
        |e| matches!(e, OutboundEvent::ApplicationUpdate { accepted, .. } if accepted.len() == 1),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rm_reconnect_resets_and_recovers_partitions() {
    let yaml = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
            resources:
              max: {memory: 1000, vcore: 10}
"#;
    let (scheduler, tx, mut rx) = Scheduler::start(fast_options());
    register_and_configure(&tx, yaml);

    tx.send(update(|r| {
        r.new_nodes = vec![node("n1", res(&[("memory", 1000), ("vcore", 10)]))];
        r.new_applications = vec![app("app-1", "root.a", "alice", &[])];
    }))
    .unwrap();
    tx.send(update(|r| {
        r.asks = vec![ask("app-1", "ask-1", res(&[("memory", 500), ("vcore", 5)]), 1)];
    }))
    .unwrap();
    let event = wait_for(&mut rx, |e| matches!(e, OutboundEvent::NewAllocations { .. })).await;
    let allocation = match event {
        OutboundEvent::NewAllocations { allocations, .. } => allocations[0].clone(),
        _ => unreachable!(),
    };

    // the RM reconnects: register again, then resend the configuration.
    // The old partition is torn down synchronously so the snapshot lands
    // on a clean slate, not on the half-dead partition.
    register_and_configure(&tx, yaml);
    wait_for(&mut rx, |e| {
        matches!(e, OutboundEvent::ReleaseAllocations { releases, .. }
            if releases.iter().any(|r| r.message == "partition removed"))
    })
    .await;
    let cluster = scheduler.cluster();
    wait_until("partition reset", || {
        cluster
            .get_partition("default@rm-1")
            .map(|p| p.total_resource().is_zero() && p.applications().is_empty())
            .unwrap_or(false)
    })
    .await;

    // the RM re-syncs its nodes, reporting the allocation that still runs
    tx.send(update(|r| {
        r.new_nodes = vec![NewNode {
            node_id: "n1".to_string(),
            attributes: HashMap::new(),
            capacity: res(&[("memory", 1000), ("vcore", 10)]),
            existing_allocations: vec![allocation.clone()],
        }];
    }))
    .unwrap();
    let partition = scheduler.cluster().get_partition("default@rm-1").unwrap();
    wait_until("allocation recovered", || {
        partition
            .get_queue("root.a")
            .map(|q| q.allocated_resource() == res(&[("memory", 500), ("vcore", 5)]))
            .unwrap_or(false)
    })
    .await;
    let recovered = partition.get_application("app-1").expect("application rebuilt");
    assert_eq!(recovered.allocation_count(), 1);
    assert_eq!(recovered.allocations()[0].uuid, allocation.uuid);

    // and the rebuilt partition accepts new work
    tx.send(update(|r| {
        r.new_applications = vec![app("app-2", "root.a", "bob", &[])];
    }))
    .unwrap();
    wait_for(
        &mut rx,
        |e| matches!(e, OutboundEvent::ApplicationUpdate { accepted, .. }
            if accepted.iter().any(|a| a.application_id == "app-2")),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unmanaged_queue_is_cleaned_up_when_empty() {
    let (scheduler, tx, mut rx) = Scheduler::start(fast_options());
    register_and_configure(
        &tx,
        r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: dev
            parent: true
    placementrules:
      - name: User
        create: true
        parent:
          name: PrimaryGroup
          create: false
"#,
    );

    tx.send(update(|r| {
        r.new_applications = vec![app("app-1", "", "alice", &["dev"])];
    }))
    .unwrap();
    wait_for(
        &mut rx,
        |e| matches!(e, OutboundEvent::ApplicationUpdate { accepted, .. } if accepted.len() == 1),
    )
    .await;
    let partition = scheduler.cluster().get_partition("default@rm-1").unwrap();
    assert!(partition.get_queue("root.dev.alice").is_some());

    // once the application is gone the unmanaged queue is removed by the
    // partition manager; the managed parent stays
    tx.send(update(|r| {
        r.remove_applications = vec![canopy_common::events::RemoveApplication {
            application_id: "app-1".to_string(),
            partition_name: "default".to_string(),
        }];
    }))
    .unwrap();
    wait_until("unmanaged queue removed", || {
        partition.get_queue("root.dev.alice").is_none()
    })
    .await;
    assert!(partition.get_queue("root.dev").is_some());
}
