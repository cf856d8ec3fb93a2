//! Cluster wide scheduling state: one schedule context per partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::partition::PartitionScheduleContext;

#[derive(Default)]
pub struct ClusterSchedulingContext {
    partitions: RwLock<HashMap<String, Arc<PartitionScheduleContext>>>,
    need_preemption: AtomicBool,
}

impl ClusterSchedulingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_partition(&self, ctx: Arc<PartitionScheduleContext>) {
        if ctx.cache().preemption_enabled() {
            self.need_preemption.store(true, Ordering::Relaxed);
        }
        self.partitions
            .write()
            .insert(ctx.name().to_string(), ctx);
    }

    pub fn get_partition(&self, name: &str) -> Option<Arc<PartitionScheduleContext>> {
        self.partitions.read().get(name).cloned()
    }

    pub fn partitions(&self) -> Vec<Arc<PartitionScheduleContext>> {
        self.partitions.read().values().cloned().collect()
    }

    pub fn partitions_for_rm(&self, rm_id: &str) -> Vec<Arc<PartitionScheduleContext>> {
        self.partitions
            .read()
            .values()
            .filter(|p| p.rm_id() == rm_id)
            .cloned()
            .collect()
    }

    /// Whether any partition may need the preemption pass at all.
    pub fn need_preemption(&self) -> bool {
        self.need_preemption.load(Ordering::Relaxed)
    }

    /// Final unlink after teardown. Guarded by identity so a stale context
    /// cannot unlink the fresh one that took over its name on reconnect.
    pub fn remove_partition(&self, ctx: &Arc<PartitionScheduleContext>) -> bool {
        let mut partitions = self.partitions.write();
        match partitions.get(ctx.name()) {
            Some(current) if Arc::ptr_eq(current, ctx) => {
                partitions.remove(ctx.name());
                true
            }
            _ => false,
        }
    }
}
