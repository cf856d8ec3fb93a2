//! A placed allocation as the cache tracks it.

use std::collections::HashMap;

use uuid::Uuid;

use canopy_common::events::Allocation;
use canopy_common::resources::Resource;

/// One container bound to a node. Owned by its application; the node and
/// queue indexes hold the same record by uuid.
#[derive(Clone, Debug)]
pub struct AllocationInfo {
    pub uuid: Uuid,
    pub allocation_key: String,
    pub application_id: String,
    pub node_id: String,
    pub queue_name: String,
    pub partition_name: String,
    pub resource: Resource,
    pub priority: i32,
    pub tags: HashMap<String, String>,
}

impl AllocationInfo {
    /// The outbound wire form of this allocation.
    pub fn to_event(&self) -> Allocation {
        Allocation {
            uuid: self.uuid,
            allocation_key: self.allocation_key.clone(),
            application_id: self.application_id.clone(),
            node_id: self.node_id.clone(),
            queue_name: self.queue_name.clone(),
            partition_name: self.partition_name.clone(),
            resource: self.resource.clone(),
            priority: self.priority,
            tags: self.tags.clone(),
        }
    }

    /// Rebuild a cache record from an RM reported allocation (recovery).
    pub fn from_event(alloc: &Allocation) -> Self {
        Self {
            uuid: alloc.uuid,
            allocation_key: alloc.allocation_key.clone(),
            application_id: alloc.application_id.clone(),
            node_id: alloc.node_id.clone(),
            queue_name: alloc.queue_name.clone(),
            partition_name: alloc.partition_name.clone(),
            resource: alloc.resource.clone(),
            priority: alloc.priority,
            tags: alloc.tags.clone(),
        }
    }
}

impl std::fmt::Display for AllocationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} app={} node={} queue={} resource={}",
            self.uuid, self.application_id, self.node_id, self.queue_name, self.resource
        )
    }
}
