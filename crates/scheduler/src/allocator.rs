//! The per-partition allocation loop.
//!
//! Each tick makes a bounded number of attempts. One attempt walks the
//! queue tree depth first - children ordered by the parent's queue sort
//! policy, applications by the leaf's policy, asks by priority then
//! arrival - and tries the candidate nodes in most-available-first order.
//! A hit is committed to the cache immediately so the next attempt sees
//! its effect; a miss leaves the ask pending for the next tick.

use std::sync::Arc;

use tracing::{debug, error, warn};

use canopy_cache::partition::AllocationProposal;
use canopy_cache::AllocationInfo;
use canopy_common::events::AllocationRelease;

use crate::application::{SchedulingApplication, SchedulingAsk};
use crate::node::SchedulingNode;
use crate::partition::PartitionScheduleContext;
use crate::preemption::{self, PreemptionContext};
use crate::queue::SchedulingQueue;
use crate::sorters;

/// A proposal the traversal settled on, not yet applied to the cache.
struct Proposal {
    app: Arc<SchedulingApplication>,
    ask: Arc<SchedulingAsk>,
    leaf: Arc<SchedulingQueue>,
    node: Arc<SchedulingNode>,
    victims: Vec<AllocationInfo>,
}

/// An allocation applied to the cache, together with the victims released
/// to make room for it.
pub struct CommittedAllocation {
    pub allocation: AllocationInfo,
    pub releases: Vec<AllocationInfo>,
}

/// One scheduling tick: a bounded regular pass, then - when the partition
/// enables it - a bounded preemption pass for queues below their
/// guarantee.
pub fn schedule_once(
    ctx: &PartitionScheduleContext,
    max_allocations: usize,
) -> Vec<CommittedAllocation> {
    let mut committed = Vec::new();
    let root = ctx.root();

    for _ in 0..max_allocations {
        let Some(proposal) = try_allocate(&root, ctx, None) else {
            break;
        };
        if let Some(done) = commit(ctx, proposal) {
            committed.push(done);
        }
    }

    if ctx.cache().preemption_enabled() {
        let mut pctx = PreemptionContext::new(&root, ctx.cache().total_resource());
        for _ in 0..max_allocations {
            let Some(proposal) = try_allocate(&root, ctx, Some(&mut pctx)) else {
                break;
            };
            if let Some(done) = commit(ctx, proposal) {
                committed.push(done);
            }
        }
    }
    committed
}

/// Depth-first search for the next allocatable ask below `queue`.
fn try_allocate(
    queue: &Arc<SchedulingQueue>,
    ctx: &PartitionScheduleContext,
    mut preemption: Option<&mut PreemptionContext>,
) -> Option<Proposal> {
    if !queue.is_schedulable() {
        return None;
    }
    if !queue.is_leaf() {
        let mut children = queue.children();
        sorters::sort_queues(&mut children, queue.queue_sort_policy());
        for child in children {
            if let Some(proposal) = try_allocate(&child, ctx, preemption.as_deref_mut()) {
                return Some(proposal);
            }
        }
        return None;
    }
    try_allocate_leaf(queue, ctx, preemption)
}

fn try_allocate_leaf(
    leaf: &Arc<SchedulingQueue>,
    ctx: &PartitionScheduleContext,
    mut preemption: Option<&mut PreemptionContext>,
) -> Option<Proposal> {
    let cluster_total = ctx.cache().total_resource();
    let mut apps = leaf.applications();
    sorters::sort_applications(&mut apps, leaf.application_sort_policy(), &cluster_total);

    let mut nodes = ctx.nodes();
    sorters::sort_nodes(&mut nodes);

    for app in apps {
        if !app.cached().is_schedulable() {
            continue;
        }
        for ask in app.pending_asks() {
            // nodes failing the ask's placement constraint are never candidates
            let candidates: Vec<Arc<SchedulingNode>> = nodes
                .iter()
                .filter(|n| constraint_matches(&ask, n))
                .cloned()
                .collect();
            match preemption.as_deref_mut() {
                None => {
                    // ancestor headroom gate: in-flight and confirmed usage
                    // both count against every max on the path
                    if let Some(headroom) = leaf.headroom() {
                        if !ask.resource.fits_in(&headroom) {
                            debug!(queue = %leaf.path(), ask = %ask.allocation_key,
                                "ask exceeds queue headroom");
                            continue;
                        }
                    }
                    for node in &candidates {
                        if !node.can_allocate(&ask.resource, false) {
                            continue;
                        }
                        return Some(Proposal {
                            app: app.clone(),
                            ask: ask.clone(),
                            leaf: leaf.clone(),
                            node: node.clone(),
                            victims: Vec::new(),
                        });
                    }
                    // no node fits this tick, the ask stays pending
                }
                Some(pctx) => {
                    // preemption only serves queues below their guarantee
                    let guaranteed = leaf.cached().guaranteed_resource();
                    if leaf
                        .may_allocated()
                        .strictly_greater_than_or_equals(&guaranteed)
                    {
                        continue;
                    }
                    let Some(result) =
                        preemption::try_preempt(pctx, leaf, &ctx.root(), &ask, &candidates)
                    else {
                        continue;
                    };
                    let Some(node) = ctx.node(&result.node_id) else {
                        continue;
                    };
                    return Some(Proposal {
                        app: app.clone(),
                        ask: ask.clone(),
                        leaf: leaf.clone(),
                        node,
                        victims: result.victims,
                    });
                }
            }
        }
    }
    None
}

fn constraint_matches(ask: &SchedulingAsk, node: &SchedulingNode) -> bool {
    ask.placement_constraint
        .as_ref()
        .map_or(true, |c| c.matches(&node.cached().attributes()))
}

/// Apply a proposal: record the in-flight intent on the mirror, release
/// the victims, commit to the cache, then drain the intent. A refused
/// commit rolls the mirror back and leaves the ask pending.
fn commit(ctx: &PartitionScheduleContext, proposal: Proposal) -> Option<CommittedAllocation> {
    let Proposal {
        app,
        ask,
        leaf,
        node,
        victims,
    } = proposal;

    if !app.allocate(&ask) {
        return None;
    }
    leaf.dec_pending(&ask.resource);
    leaf.inc_allocating(&ask.resource);
    node.inc_allocating(&ask.resource);

    // victims go first so the ask has room to land
    let mut releases = Vec::new();
    for victim in &victims {
        let released = ctx.cache().release_allocations(&AllocationRelease {
            partition_name: ctx.cache().name().to_string(),
            application_id: victim.application_id.clone(),
            uuid: Some(victim.uuid),
            message: format!(
                "preempted for ask {} of application {}",
                ask.allocation_key, ask.application_id
            ),
        });
        for r in &released {
            if let Some(victim_queue) = ctx.root().find_queue(&r.queue_name) {
                victim_queue.dec_marked_preempted(&r.resource);
            }
            node.dec_preempting(&r.resource);
        }
        releases.extend(released);
    }

    let cache_proposal = AllocationProposal {
        allocation_key: ask.allocation_key.clone(),
        application_id: ask.application_id.clone(),
        queue_name: leaf.path().to_string(),
        node_id: node.node_id().to_string(),
        resource: ask.resource.clone(),
        priority: ask.priority,
        tags: Default::default(),
    };
    match ctx.cache().add_allocation(&cache_proposal) {
        Ok(allocation) => {
            leaf.dec_allocating(&ask.resource);
            node.dec_allocating(&ask.resource);
            app.confirm(&ask.resource);
            Some(CommittedAllocation {
                allocation,
                releases,
            })
        }
        Err(e) => {
            if releases.is_empty() {
                warn!(queue = %leaf.path(), ask = %ask.allocation_key, error = %e,
                    "allocation commit refused, ask stays pending");
            } else {
                error!(queue = %leaf.path(), ask = %ask.allocation_key, error = %e,
                    "allocation commit refused after victims were already released");
            }
            app.deallocate(&ask);
            leaf.inc_pending(&ask.resource);
            leaf.dec_allocating(&ask.resource);
            node.dec_allocating(&ask.resource);
            None
        }
    }
}
