//! The cluster context: every partition of every registered RM.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use canopy_common::config::SchedulerConfig;
use canopy_common::normalized_partition_name;

use crate::errors::CacheError;
use crate::partition::PartitionInfo;

#[derive(Clone, Debug)]
pub struct RmRegistration {
    pub rm_id: String,
    pub policy_group: String,
    pub version: String,
}

/// Outcome of applying a configuration snapshot.
#[derive(Default)]
pub struct ConfigUpdateResult {
    /// Partitions created by this snapshot.
    pub added: Vec<Arc<PartitionInfo>>,
    /// Pre-existing partitions whose queues were refreshed.
    pub updated: Vec<Arc<PartitionInfo>>,
    /// Names of partitions dropped from the snapshot; the caller tears
    /// them down through their partition managers.
    pub removed: Vec<String>,
}

#[derive(Default)]
pub struct ClusterInfo {
    partitions: RwLock<HashMap<String, Arc<PartitionInfo>>>,
    registrations: RwLock<HashMap<String, RmRegistration>>,
}

impl ClusterInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an RM registration. Returns true when this RM was already
    /// known, meaning its partitions must be reset and re-synced.
    pub fn register_rm(&self, rm_id: &str, policy_group: &str, version: &str) -> bool {
        let mut registrations = self.registrations.write();
        let known = registrations.contains_key(rm_id);
        registrations.insert(
            rm_id.to_string(),
            RmRegistration {
                rm_id: rm_id.to_string(),
                policy_group: policy_group.to_string(),
                version: version.to_string(),
            },
        );
        info!(rm_id, policy_group, version, re_registration = known, "resource manager registered");
        known
    }

    pub fn registration(&self, rm_id: &str) -> Option<RmRegistration> {
        self.registrations.read().get(rm_id).cloned()
    }

    /// Apply a validated snapshot for one RM: new partitions are created,
    /// existing ones refreshed, partitions missing from the snapshot are
    /// reported for removal. The snapshot must have passed validation; it
    /// is applied as a whole.
    pub fn process_config(
        &self,
        rm_id: &str,
        config: &SchedulerConfig,
    ) -> Result<ConfigUpdateResult, CacheError> {
        let mut result = ConfigUpdateResult::default();
        let mut named: HashSet<String> = HashSet::new();

        for partition_conf in &config.partitions {
            let name = normalized_partition_name(&partition_conf.name, rm_id);
            named.insert(name.clone());
            let existing = self.get_partition(&name);
            match existing {
                Some(partition) => {
                    partition.update_config(partition_conf)?;
                    result.updated.push(partition);
                }
                None => {
                    let partition = PartitionInfo::from_config(partition_conf, rm_id)?;
                    self.partitions
                        .write()
                        .insert(name.clone(), partition.clone());
                    result.added.push(partition);
                }
            }
        }

        for partition in self.partitions_for_rm(rm_id) {
            if !named.contains(partition.name()) {
                warn!(partition = %partition.name(), "partition dropped from configuration");
                result.removed.push(partition.name().to_string());
            }
        }
        Ok(result)
    }

    pub fn get_partition(&self, name: &str) -> Option<Arc<PartitionInfo>> {
        self.partitions.read().get(name).cloned()
    }

    pub fn partitions(&self) -> Vec<Arc<PartitionInfo>> {
        self.partitions.read().values().cloned().collect()
    }

    pub fn partitions_for_rm(&self, rm_id: &str) -> Vec<Arc<PartitionInfo>> {
        self.partitions
            .read()
            .values()
            .filter(|p| p.rm_id() == rm_id)
            .cloned()
            .collect()
    }

    /// Final unlink of a partition once teardown finished. Guarded by
    /// identity: when the name has already been taken over by a fresh
    /// partition (RM reconnect) the stale unlink is a no-op.
    pub fn remove_partition(&self, partition: &Arc<PartitionInfo>) -> bool {
        let mut partitions = self.partitions.write();
        match partitions.get(partition.name()) {
            Some(current) if Arc::ptr_eq(current, partition) => {
                partitions.remove(partition.name());
                true
            }
            _ => false,
        }
    }
}
