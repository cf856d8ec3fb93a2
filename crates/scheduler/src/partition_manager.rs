//! Per-partition background maintenance.
//!
//! The manager ticks every few seconds and removes queues that finished
//! draining as well as empty unmanaged queues. When the partition is
//! flagged for teardown the manager kills the remaining applications,
//! releases their allocations, drops the nodes and unlinks the partition
//! from both cluster contexts before exiting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use canopy_cache::{ApplicationEvent, ClusterInfo};
use canopy_common::events::{OutboundEvent, ReleasedAllocation, TerminationType};

use crate::context::ClusterSchedulingContext;
use crate::partition::PartitionScheduleContext;
use crate::queue::SchedulingQueue;

/// Default pause between cleanup runs.
pub const CLEANER_INTERVAL: Duration = Duration::from_secs(10);

pub struct PartitionManager {
    ctx: Arc<PartitionScheduleContext>,
    cluster: Arc<ClusterInfo>,
    scheduling: Arc<ClusterSchedulingContext>,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    interval: Duration,
}

impl PartitionManager {
    pub fn new(
        ctx: Arc<PartitionScheduleContext>,
        cluster: Arc<ClusterInfo>,
        scheduling: Arc<ClusterSchedulingContext>,
        outbound: mpsc::UnboundedSender<OutboundEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            ctx,
            cluster,
            scheduling,
            outbound,
            interval,
        }
    }

    /// Run until the partition is flagged for teardown, then remove it.
    pub async fn run(self) {
        info!(partition = %self.ctx.name(), interval = ?self.interval,
            "partition manager started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick of a tokio interval fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.ctx.is_stopped() {
                break;
            }
            self.clean_queues(&self.ctx.root());
        }
        // the engine may already have torn the partition down synchronously
        // (RM reconnect); teardown is idempotent and identity guarded
        teardown_partition(&self.ctx, &self.cluster, &self.scheduling, &self.outbound);
    }

    /// Bottom-up removal sweep: a queue goes when it is draining or
    /// unmanaged and holds neither children nor applications. Repeated
    /// sweeps are no-ops for what is already gone.
    fn clean_queues(&self, queue: &Arc<SchedulingQueue>) {
        for child in queue.children() {
            self.clean_queues(&child);
        }
        if !(queue.cached().is_draining() || !queue.is_managed()) {
            return;
        }
        if queue.has_children() || queue.has_applications() {
            debug!(partition = %self.ctx.name(), queue = %queue.path(),
                "queue not yet empty, skipping removal");
            return;
        }
        if queue.cached().remove_queue() {
            if let Some(parent) = queue.parent() {
                parent.remove_child(queue.cached().name());
            }
            debug!(partition = %self.ctx.name(), queue = %queue.path(), "removed queue");
        }
    }
}

/// Tear a partition down: drain every queue, kill the applications, drop
/// the nodes, then unlink from both cluster contexts. Safe to run more
/// than once: a second pass finds nothing left and the unlink refuses to
/// touch a partition that already took over the name.
pub(crate) fn teardown_partition(
    ctx: &Arc<PartitionScheduleContext>,
    cluster: &Arc<ClusterInfo>,
    scheduling: &Arc<ClusterSchedulingContext>,
    outbound: &mpsc::UnboundedSender<OutboundEvent>,
) {
    let partition = ctx.cache();
    info!(partition = %partition.name(), "removing partition");
    partition.root().mark_for_removal();

    let mut releases = Vec::new();
    for app in partition.applications() {
        // already finished applications refuse the kill
        let _ = app.handle_event(ApplicationEvent::Kill);
        if let Some(released) = ctx.remove_application(app.application_id()) {
            releases.extend(released.into_iter().map(|a| ReleasedAllocation {
                uuid: a.uuid,
                application_id: a.application_id,
                partition_name: a.partition_name,
                termination_type: TerminationType::StoppedByRM,
                message: "partition removed".to_string(),
            }));
        }
    }
    if !releases.is_empty() {
        let _ = outbound.send(OutboundEvent::ReleaseAllocations {
            rm_id: ctx.rm_id().to_string(),
            releases,
        });
    }
    for node in partition.nodes() {
        partition.remove_node(node.node_id());
    }

    cluster.remove_partition(partition);
    scheduling.remove_partition(ctx);
    info!(partition = %partition.name(), "partition removed");
}
