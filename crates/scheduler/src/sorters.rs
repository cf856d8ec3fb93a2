//! Sort policies for queues, applications and nodes.
//!
//! All sorts are stable and carry an explicit identity tie-break (queue
//! path, application id, node id) so that equal fairness ratios still give
//! a reproducible traversal order.

use std::sync::Arc;

use canopy_common::resources::{comp_fairness_ratio, comp_usage, Resource};

use crate::application::SchedulingApplication;
use crate::node::SchedulingNode;
use crate::queue::SchedulingQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortPolicy {
    /// Ascending dominant share of usage against the fairness baseline.
    Fair,
    /// Ascending submission time (applications only).
    Fifo,
    /// Descending dominant share of available resource (nodes only).
    MaxAvailable,
}

/// Order child queues for traversal under their parent's policy.
pub fn sort_queues(queues: &mut [Arc<SchedulingQueue>], policy: SortPolicy) {
    if policy == SortPolicy::Fair {
        queues.sort_by(|l, r| {
            comp_fairness_ratio(
                &l.proposed_usage(),
                &l.cached().guaranteed_resource(),
                &r.proposed_usage(),
                &r.cached().guaranteed_resource(),
            )
            .then_with(|| l.path().cmp(r.path()))
        });
    }
}

/// Order a leaf's applications under the leaf's policy. The fair policy
/// compares each application's possible usage against the cluster total.
pub fn sort_applications(
    apps: &mut [Arc<SchedulingApplication>],
    policy: SortPolicy,
    cluster_total: &Resource,
) {
    match policy {
        SortPolicy::Fair => {
            apps.sort_by(|l, r| {
                comp_fairness_ratio(
                    &l.may_allocated_resource(),
                    cluster_total,
                    &r.may_allocated_resource(),
                    cluster_total,
                )
                .then_with(|| l.application_id().cmp(r.application_id()))
            });
        }
        SortPolicy::Fifo | SortPolicy::MaxAvailable => {
            apps.sort_by(|l, r| {
                l.cached()
                    .submission_time()
                    .cmp(&r.cached().submission_time())
                    .then_with(|| l.application_id().cmp(r.application_id()))
            });
        }
    }
}

/// Order candidate nodes: most available resource first.
pub fn sort_nodes(nodes: &mut [Arc<SchedulingNode>]) {
    nodes.sort_by(|l, r| {
        comp_usage(&r.allocatable_resource(), &l.allocatable_resource())
            .then_with(|| l.node_id().cmp(r.node_id()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_cache::{ApplicationInfo, NodeInfo, QueueInfo};
    use canopy_common::config::QueueConfig;
    use canopy_common::events::NewNode;
    use canopy_common::security::UserGroup;
    use std::collections::HashMap;

    fn mirror_with_leaves() -> Arc<SchedulingQueue> {
        let conf: QueueConfig = serde_yaml::from_str(
            r#"
name: root
parent: true
queues:
  - name: a
    resources:
      guaranteed: {memory: 500}
  - name: b
    resources:
      guaranteed: {memory: 500}
"#,
        )
        .unwrap();
        SchedulingQueue::from_cache(QueueInfo::from_config(&conf).unwrap())
    }

    #[test]
    fn test_fair_queue_sort_prefers_lower_usage() {
        let root = mirror_with_leaves();
        let a = root.find_queue("root.a").unwrap();
        let b = root.find_queue("root.b").unwrap();

        b.inc_allocating(&Resource::from_pairs([("memory".to_string(), 300)]));
        let mut queues = vec![b.clone(), a.clone()];
        sort_queues(&mut queues, SortPolicy::Fair);
        assert_eq!(queues[0].path(), "root.a");

        // equal usage: lexicographic path decides
        a.inc_allocating(&Resource::from_pairs([("memory".to_string(), 300)]));
        let mut queues = vec![b.clone(), a.clone()];
        sort_queues(&mut queues, SortPolicy::Fair);
        assert_eq!(queues[0].path(), "root.a");
        assert_eq!(queues[1].path(), "root.b");
    }

    fn app(id: &str) -> Arc<SchedulingApplication> {
        Arc::new(SchedulingApplication::new(Arc::new(ApplicationInfo::new(
            id,
            "default@rm-1",
            "root.a",
            UserGroup::new("alice", vec![]),
            HashMap::new(),
        ))))
    }

    #[test]
    fn test_fifo_application_sort_by_submission() {
        let first = app("app-b");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = app("app-a");
        let mut apps = vec![second.clone(), first.clone()];
        sort_applications(&mut apps, SortPolicy::Fifo, &Resource::new());
        // first submitted comes first even with a larger id
        assert_eq!(apps[0].application_id(), "app-b");
    }

    fn node(id: &str, memory: i64) -> Arc<SchedulingNode> {
        Arc::new(SchedulingNode::new(Arc::new(NodeInfo::new(&NewNode {
            node_id: id.to_string(),
            attributes: HashMap::new(),
            capacity: Resource::from_pairs([("memory".to_string(), memory)]),
            existing_allocations: vec![],
        }))))
    }

    #[test]
    fn test_node_sort_most_available_first() {
        let mut nodes = vec![node("n1", 100), node("n2", 900), node("n3", 500)];
        sort_nodes(&mut nodes);
        let order: Vec<&str> = nodes.iter().map(|n| n.node_id()).collect();
        assert_eq!(order, vec!["n2", "n3", "n1"]);

        // ties break on node id
        let mut nodes = vec![node("n2", 100), node("n1", 100)];
        sort_nodes(&mut nodes);
        assert_eq!(nodes[0].node_id(), "n1");
    }
}
