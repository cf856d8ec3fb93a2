//! Cross-queue preemption based on dominant resource fairness.
//!
//! When an ask of a queue below its guaranteed share cannot be placed, the
//! engine computes where on the preemptor's ancestor chain headroom is
//! short, then looks for one node on which releasing victims both frees
//! enough room for the ask and demonstrably reduces those shortages. Either
//! a complete victim set is found on a single node or nothing is emitted.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use canopy_cache::AllocationInfo;
use canopy_common::resources::{comp_fairness_ratio, Resource};

use crate::application::SchedulingAsk;
use crate::node::SchedulingNode;
use crate::queue::SchedulingQueue;

/// Victim selection for one tick's preemption pass. Preemptable amounts are
/// tracked here so consecutive proposals in the same pass do not select the
/// same surplus twice.
pub(crate) struct PreemptionContext {
    partition_total: Resource,
    /// Remaining preemptable surplus per leaf queue path:
    /// `max(0, allocated - guaranteed)` at the start of the pass.
    preemptable: HashMap<String, Resource>,
}

/// A qualifying victim set on one node. An empty victim list is the lucky
/// case: the ask fits once the resources already marked preempting drain.
pub(crate) struct PreemptionResult {
    pub node_id: String,
    pub victims: Vec<AllocationInfo>,
}

impl PreemptionContext {
    pub(crate) fn new(root: &Arc<SchedulingQueue>, partition_total: Resource) -> Self {
        let mut preemptable = HashMap::new();
        collect_preemptable(root, &mut preemptable);
        Self {
            partition_total,
            preemptable,
        }
    }

    fn preemptable(&self, queue_path: &str) -> Option<&Resource> {
        self.preemptable.get(queue_path)
    }

    fn reduce_preemptable(&mut self, queue_path: &str, delta: &Resource) {
        if let Some(surplus) = self.preemptable.get_mut(queue_path) {
            *surplus = surplus.sub_eliminate_negative(delta);
        }
    }
}

fn collect_preemptable(queue: &Arc<SchedulingQueue>, into: &mut HashMap<String, Resource>) {
    if queue.is_leaf() {
        let surplus = queue
            .cached()
            .allocated_resource()
            .sub_eliminate_negative(&queue.cached().guaranteed_resource());
        into.insert(queue.path().to_string(), surplus);
        return;
    }
    for child in queue.children() {
        collect_preemptable(&child, into);
    }
}

/// Headroom shortages of the preemptor and its ancestors: for every queue
/// on the chain with a max limit, how much of the ask does not fit into
/// `max - may_allocated + marked_preempted`.
fn init_headroom_shortages(
    preemptor: &Arc<SchedulingQueue>,
    ask_resource: &Resource,
) -> HashMap<String, Resource> {
    let mut shortages = HashMap::new();
    let mut current = Some(preemptor.clone());
    while let Some(queue) = current {
        if let Some(max) = queue.cached().max_resource() {
            let headroom = max
                .sub(&queue.may_allocated())
                .add(&queue.marked_preempted_resource());
            let shortage = ask_resource.sub_eliminate_negative(&headroom);
            if shortage.strictly_greater_than_zero() {
                shortages.insert(queue.path().to_string(), shortage);
            }
        }
        current = queue.parent();
    }
    shortages
}

/// Credit a victim's resource against the shortage map along the victim
/// queue's ancestor chain. Returns whether any shortage strictly shrank;
/// shortages that reach zero are dropped from the map.
fn headroom_shortage_update(
    victim_queue: &Arc<SchedulingQueue>,
    victim_resource: &Resource,
    shortages: &mut HashMap<String, Resource>,
) -> bool {
    if shortages.is_empty() {
        return false;
    }
    let mut positive_contribution = false;
    let mut current = Some(victim_queue.clone());
    while let Some(queue) = current {
        if let Some(shortage) = shortages.get(queue.path()) {
            let reduced = shortage.sub_eliminate_negative(victim_resource);
            if shortage.strictly_greater_than(&reduced) {
                if reduced.strictly_greater_than_zero() {
                    shortages.insert(queue.path().to_string(), reduced);
                } else {
                    shortages.remove(queue.path());
                }
                positive_contribution = true;
            }
        }
        current = queue.parent();
    }
    positive_contribution
}

/// Try to assemble a complete victim set on one node.
fn try_surgical_preemption_on_node(
    pctx: &PreemptionContext,
    root: &Arc<SchedulingQueue>,
    preemptor_path: &str,
    node: &Arc<SchedulingNode>,
    ask: &SchedulingAsk,
    shortages: &mut HashMap<String, Resource>,
) -> Option<PreemptionResult> {
    // resource to preempt = (allocating + ask) - (preempting + available)
    let to_preempt = node
        .allocating_resource()
        .add(&ask.resource)
        .sub_eliminate_negative(
            &node
                .preempting_resource()
                .add(&node.cached().available_resource()),
        );

    // lucky: fits once the already preempting resources drain
    if node.can_allocate(&ask.resource, true) {
        return Some(PreemptionResult {
            node_id: node.node_id().to_string(),
            victims: Vec::new(),
        });
    }

    let mut victims = Vec::new();
    let mut total_released = Resource::new();

    for allocation in node.cached().allocations() {
        let Some(victim_queue) = root.find_queue(&allocation.queue_name) else {
            continue;
        };
        // the preemptor never preempts itself
        if allocation.queue_name == preemptor_path {
            continue;
        }
        let Some(surplus) = pctx.preemptable(&allocation.queue_name) else {
            continue;
        };
        // queues at or below their guarantee are off limits
        if !surplus.strictly_greater_than_zero() {
            continue;
        }
        // preempting here must shrink the surplus in the dimensions the ask
        // needs: do not kill a cpu container for a gpu shortage
        let after = surplus.sub_eliminate_negative(&ask.resource);
        if comp_fairness_ratio(&after, &pctx.partition_total, surplus, &pctx.partition_total)
            != std::cmp::Ordering::Less
        {
            continue;
        }
        // when the preemptor is headroom-short the victim must demonstrably
        // reduce a shortage on the chain
        let contributed =
            headroom_shortage_update(&victim_queue, &allocation.resource, shortages);
        if !shortages.is_empty() && !contributed {
            continue;
        }

        total_released.add_to(&allocation.resource);
        victims.push(allocation);

        if total_released.strictly_greater_than_or_equals(&to_preempt) {
            return Some(PreemptionResult {
                node_id: node.node_id().to_string(),
                victims,
            });
        }
    }
    None
}

/// Full preemption attempt for one ask: compute shortages, scan the nodes
/// in order, record the bookkeeping for a hit. Returns `None` when no node
/// yields a qualifying victim set; the ask simply stays pending.
pub(crate) fn try_preempt(
    pctx: &mut PreemptionContext,
    preemptor: &Arc<SchedulingQueue>,
    root: &Arc<SchedulingQueue>,
    ask: &Arc<SchedulingAsk>,
    nodes: &[Arc<SchedulingNode>],
) -> Option<PreemptionResult> {
    let mut shortages = init_headroom_shortages(preemptor, &ask.resource);

    let mut hit: Option<PreemptionResult> = None;
    let mut hit_node: Option<&Arc<SchedulingNode>> = None;
    for node in nodes {
        if let Some(result) = try_surgical_preemption_on_node(
            pctx,
            root,
            preemptor.path(),
            node,
            ask,
            &mut shortages,
        ) {
            hit_node = Some(node);
            hit = Some(result);
            break;
        }
    }
    let (result, node) = (hit?, hit_node?);

    let mut total_released = Resource::new();
    for victim in &result.victims {
        if let Some(victim_queue) = root.find_queue(&victim.queue_name) {
            victim_queue.inc_marked_preempted(&victim.resource);
        }
        pctx.reduce_preemptable(&victim.queue_name, &victim.resource);
        total_released.add_to(&victim.resource);
    }
    node.inc_preempting(&total_released);

    debug!(ask = %ask.allocation_key, node = %result.node_id, victims = result.victims.len(),
        released = %total_released, "preemption victim set selected");
    Some(result)
}
