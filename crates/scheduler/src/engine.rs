//! The scheduler engine: event plumbing and task lifecycle.
//!
//! [`Scheduler::start`] returns the inbound sender the RM shim pushes
//! deltas into and the outbound receiver it drains allocations, rejections
//! and releases from. Internally one ingress task serializes the inbound
//! channel into the caches; every partition runs its own scheduling task
//! and partition manager task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use canopy_cache::ClusterInfo;
use canopy_common::config::SchedulerConfig;
use canopy_common::events::{
    AcceptedApplication, AcceptedNode, InboundEvent, OutboundEvent, RejectedAllocationAsk,
    RejectedApplication, RejectedNode, ReleasedAllocation, TerminationType, UpdateRequest,
};
use canopy_common::normalized_partition_name;

use canopy_cache::node::ATTR_PARTITION;

use crate::allocator;
use crate::context::ClusterSchedulingContext;
use crate::partition::PartitionScheduleContext;
use crate::partition_manager::{teardown_partition, PartitionManager, CLEANER_INTERVAL};

#[derive(Clone, Copy, Debug)]
pub struct SchedulerOptions {
    /// Pause between allocation ticks of one partition.
    pub tick: Duration,
    /// Allocation attempts per tick and per pass.
    pub max_allocations: usize,
    /// Pause between partition manager cleanup runs.
    pub cleaner_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            max_allocations: 16,
            cleaner_interval: CLEANER_INTERVAL,
        }
    }
}

struct Core {
    options: SchedulerOptions,
    cluster: Arc<ClusterInfo>,
    scheduling: Arc<ClusterSchedulingContext>,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
}

/// Handle on a running scheduler core.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Core>,
}

impl Scheduler {
    /// Boot the core: returns the handle, the inbound event sender and the
    /// outbound event receiver.
    pub fn start(
        options: SchedulerOptions,
    ) -> (
        Scheduler,
        mpsc::UnboundedSender<InboundEvent>,
        mpsc::UnboundedReceiver<OutboundEvent>,
    ) {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let core = Arc::new(Core {
            options,
            cluster: Arc::new(ClusterInfo::new()),
            scheduling: Arc::new(ClusterSchedulingContext::new()),
            outbound: outbound_tx,
        });
        let scheduler = Scheduler { core: core.clone() };

        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                handle_event(&core, event);
            }
            debug!("inbound channel closed, ingress task exits");
        });
        (scheduler, inbound_tx, outbound_rx)
    }

    pub fn cluster(&self) -> &Arc<ClusterInfo> {
        &self.core.cluster
    }

    pub fn context(&self) -> &Arc<ClusterSchedulingContext> {
        &self.core.scheduling
    }
}

fn handle_event(core: &Arc<Core>, event: InboundEvent) {
    match event {
        InboundEvent::RegisterResourceManager {
            rm_id,
            policy_group,
            version,
        } => handle_register(core, &rm_id, &policy_group, &version),
        InboundEvent::ConfigUpdate { rm_id, config } => handle_config(core, &rm_id, &config),
        InboundEvent::Update(request) => handle_update(core, request),
    }
}

fn handle_register(core: &Arc<Core>, rm_id: &str, policy_group: &str, version: &str) {
    let known = core.cluster.register_rm(rm_id, policy_group, version);
    if known {
        // a reconnect resets every partition of the RM. The teardown runs
        // here, synchronously: the next message is the RM's configuration
        // and it must land on a clean slate, not on a partition whose
        // manager has yet to wake up and finish the removal.
        info!(rm_id, "re-registration, resetting partitions");
        for partition in core.scheduling.partitions_for_rm(rm_id) {
            partition.stop();
            teardown_partition(&partition, &core.cluster, &core.scheduling, &core.outbound);
        }
    }
}

fn handle_config(core: &Arc<Core>, rm_id: &str, config: &SchedulerConfig) {
    // finish any teardown still pending for this RM so the snapshot never
    // lands on a stale partition and gets lost with it
    for ctx in core.scheduling.partitions_for_rm(rm_id) {
        if ctx.is_stopped() {
            teardown_partition(&ctx, &core.cluster, &core.scheduling, &core.outbound);
        }
    }

    let result = match core.cluster.process_config(rm_id, config) {
        Ok(result) => result,
        Err(e) => {
            // the previous configuration stays in force
            warn!(rm_id, error = %e, "configuration rejected");
            return;
        }
    };
    for partition in result.added {
        match PartitionScheduleContext::new(partition) {
            Ok(ctx) => spawn_partition(core, Arc::new(ctx)),
            Err(e) => warn!(rm_id, error = %e, "failed to build scheduling context"),
        }
    }
    for partition in result.updated {
        match core.scheduling.get_partition(partition.name()) {
            Some(ctx) if !ctx.is_stopped() => {
                if let Err(e) = ctx.update_from_config() {
                    warn!(partition = %partition.name(), error = %e,
                        "failed to refresh scheduling context");
                }
            }
            Some(_) => warn!(partition = %partition.name(),
                "partition stopped while applying configuration"),
            None => {
                // the cache partition exists without a live context:
                // rebuild it rather than dropping the snapshot
                match PartitionScheduleContext::new(partition.clone()) {
                    Ok(ctx) => spawn_partition(core, Arc::new(ctx)),
                    Err(e) => warn!(partition = %partition.name(), error = %e,
                        "failed to rebuild scheduling context"),
                }
            }
        }
    }
    for name in result.removed {
        if let Some(ctx) = core.scheduling.get_partition(&name) {
            ctx.stop();
        }
    }
}

fn spawn_partition(core: &Arc<Core>, ctx: Arc<PartitionScheduleContext>) {
    core.scheduling.add_partition(ctx.clone());

    let manager = PartitionManager::new(
        ctx.clone(),
        core.cluster.clone(),
        core.scheduling.clone(),
        core.outbound.clone(),
        core.options.cleaner_interval,
    );
    tokio::spawn(manager.run());

    let outbound = core.outbound.clone();
    let options = core.options;
    tokio::spawn(async move {
        info!(partition = %ctx.name(), "scheduling task started");
        let mut ticker = tokio::time::interval(options.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if ctx.is_stopped() {
                break;
            }
            for done in allocator::schedule_once(&ctx, options.max_allocations) {
                // victims travel ahead of the allocation they made room for
                if !done.releases.is_empty() {
                    let releases = done
                        .releases
                        .iter()
                        .map(|a| ReleasedAllocation {
                            uuid: a.uuid,
                            application_id: a.application_id.clone(),
                            partition_name: a.partition_name.clone(),
                            termination_type: TerminationType::PreemptedByScheduler,
                            message: format!(
                                "preempted for allocation {}",
                                done.allocation.allocation_key
                            ),
                        })
                        .collect();
                    let _ = outbound.send(OutboundEvent::ReleaseAllocations {
                        rm_id: ctx.rm_id().to_string(),
                        releases,
                    });
                }
                let _ = outbound.send(OutboundEvent::NewAllocations {
                    rm_id: ctx.rm_id().to_string(),
                    allocations: vec![done.allocation.to_event()],
                });
            }
        }
        info!(partition = %ctx.name(), "scheduling task stopped");
    });
}

fn handle_update(core: &Arc<Core>, request: UpdateRequest) {
    let rm_id = request.rm_id.clone();

    // nodes join the partition named by their attributes
    let mut accepted_nodes = Vec::new();
    let mut rejected_nodes = Vec::new();
    for node in &request.new_nodes {
        let partition_attr = node.attributes.get(ATTR_PARTITION).cloned().unwrap_or_default();
        let partition_name = normalized_partition_name(&partition_attr, &rm_id);
        match core.scheduling.get_partition(&partition_name) {
            Some(ctx) => match ctx.add_node(node) {
                Ok(()) => accepted_nodes.push(AcceptedNode {
                    node_id: node.node_id.clone(),
                }),
                Err(e) => rejected_nodes.push(RejectedNode {
                    node_id: node.node_id.clone(),
                    reason: e.to_string(),
                }),
            },
            None => rejected_nodes.push(RejectedNode {
                node_id: node.node_id.clone(),
                reason: format!("partition '{partition_name}' is not known"),
            }),
        }
    }
    if !accepted_nodes.is_empty() || !rejected_nodes.is_empty() {
        let _ = core.outbound.send(OutboundEvent::NodeUpdate {
            rm_id: rm_id.clone(),
            accepted: accepted_nodes,
            rejected: rejected_nodes,
        });
    }
    for node in &request.updated_nodes {
        let partition_attr = node.attributes.get(ATTR_PARTITION).cloned().unwrap_or_default();
        let partition_name = normalized_partition_name(&partition_attr, &rm_id);
        if let Some(ctx) = core.scheduling.get_partition(&partition_name) {
            if let Err(e) = ctx.update_node(node) {
                warn!(node = %node.node_id, error = %e, "node update failed");
            }
        }
    }

    // applications
    let mut accepted_apps = Vec::new();
    let mut rejected_apps = Vec::new();
    for app in &request.new_applications {
        let partition_name = normalized_partition_name(&app.partition_name, &rm_id);
        match core.scheduling.get_partition(&partition_name) {
            Some(ctx) => match ctx.add_application(app) {
                Ok(()) => accepted_apps.push(AcceptedApplication {
                    application_id: app.application_id.clone(),
                }),
                Err(e) => rejected_apps.push(RejectedApplication {
                    application_id: app.application_id.clone(),
                    reason: e.to_string(),
                }),
            },
            None => rejected_apps.push(RejectedApplication {
                application_id: app.application_id.clone(),
                reason: format!("partition '{partition_name}' is not known"),
            }),
        }
    }
    if !accepted_apps.is_empty() || !rejected_apps.is_empty() {
        let _ = core.outbound.send(OutboundEvent::ApplicationUpdate {
            rm_id: rm_id.clone(),
            accepted: accepted_apps,
            rejected: rejected_apps,
        });
    }

    let mut removal_releases = Vec::new();
    for removal in &request.remove_applications {
        let partition_name = normalized_partition_name(&removal.partition_name, &rm_id);
        if let Some(ctx) = core.scheduling.get_partition(&partition_name) {
            if let Some(released) = ctx.remove_application(&removal.application_id) {
                removal_releases.extend(released.into_iter().map(|a| ReleasedAllocation {
                    uuid: a.uuid,
                    application_id: a.application_id,
                    partition_name: a.partition_name,
                    termination_type: TerminationType::StoppedByRM,
                    message: "application removed".to_string(),
                }));
            }
        }
    }

    // asks
    let mut rejected_asks = Vec::new();
    for ask in &request.asks {
        let partition_name = normalized_partition_name(&ask.partition_name, &rm_id);
        let outcome = match core.scheduling.get_partition(&partition_name) {
            Some(ctx) => ctx.update_ask(ask).err().map(|e| e.to_string()),
            None => Some(format!("partition '{partition_name}' is not known")),
        };
        if let Some(reason) = outcome {
            rejected_asks.push(RejectedAllocationAsk {
                allocation_key: ask.allocation_key.clone(),
                application_id: ask.application_id.clone(),
                reason,
            });
        }
    }
    if !rejected_asks.is_empty() {
        let _ = core.outbound.send(OutboundEvent::RejectedAllocationAsks {
            rm_id: rm_id.clone(),
            rejected: rejected_asks,
        });
    }

    // releases
    let mut released = removal_releases;
    for release in &request.releases.allocations {
        let partition_name = normalized_partition_name(&release.partition_name, &rm_id);
        if let Some(ctx) = core.scheduling.get_partition(&partition_name) {
            released.extend(
                ctx.release_allocations(release)
                    .into_iter()
                    .map(|a| ReleasedAllocation {
                        uuid: a.uuid,
                        application_id: a.application_id,
                        partition_name: a.partition_name,
                        termination_type: TerminationType::StoppedByRM,
                        message: release.message.clone(),
                    }),
            );
        }
    }
    for ask_release in &request.releases.asks {
        let partition_name = normalized_partition_name(&ask_release.partition_name, &rm_id);
        if let Some(ctx) = core.scheduling.get_partition(&partition_name) {
            ctx.release_ask(ask_release);
        }
    }
    if !released.is_empty() {
        let _ = core.outbound.send(OutboundEvent::ReleaseAllocations {
            rm_id,
            releases: released,
        });
    }
}
