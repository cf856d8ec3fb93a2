//! Node records: capacity, confirmed usage and the allocation index.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::warn;
use uuid::Uuid;

use canopy_common::events::{NewNode, UpdatedNode};
use canopy_common::resources::Resource;

use crate::allocation::AllocationInfo;
use crate::errors::CacheError;

/// Well known node attribute keys.
pub const ATTR_HOSTNAME: &str = "hostname";
pub const ATTR_RACK: &str = "rack";
pub const ATTR_PARTITION: &str = "partition";

pub struct NodeInfo {
    node_id: String,
    inner: RwLock<NodeInner>,
}

struct NodeInner {
    attributes: HashMap<String, String>,
    capacity: Resource,
    allocated: Resource,
    available: Resource,
    allocations: HashMap<Uuid, AllocationInfo>,
}

impl NodeInfo {
    pub fn new(node: &NewNode) -> Self {
        Self {
            node_id: node.node_id.clone(),
            inner: RwLock::new(NodeInner {
                attributes: node.attributes.clone(),
                capacity: node.capacity.clone(),
                allocated: Resource::new(),
                available: node.capacity.clone(),
                allocations: HashMap::new(),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.inner.read().attributes.get(key).cloned()
    }

    pub fn attributes(&self) -> HashMap<String, String> {
        self.inner.read().attributes.clone()
    }

    pub fn capacity(&self) -> Resource {
        self.inner.read().capacity.clone()
    }

    pub fn allocated_resource(&self) -> Resource {
        self.inner.read().allocated.clone()
    }

    /// Capacity minus confirmed allocations. In-flight scheduler intent is
    /// tracked on the scheduling twin, not here.
    pub fn available_resource(&self) -> Resource {
        self.inner.read().available.clone()
    }

    pub fn allocations(&self) -> Vec<AllocationInfo> {
        self.inner.read().allocations.values().cloned().collect()
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.read().allocations.len()
    }

    /// Apply an RM node update. Shrinking the capacity below the allocated
    /// total is accepted; available clamps at zero until allocations drain.
    pub fn update(&self, update: &UpdatedNode) {
        let mut inner = self.inner.write();
        if !update.attributes.is_empty() {
            inner.attributes = update.attributes.clone();
        }
        if let Some(capacity) = &update.capacity {
            inner.capacity = capacity.clone();
            inner.available = inner.capacity.sub_eliminate_negative(&inner.allocated);
        }
    }

    /// Index an allocation and account its resource. Fails when the
    /// allocation does not fit the remaining available resource.
    pub fn add_allocation(&self, allocation: AllocationInfo) -> Result<(), CacheError> {
        let mut inner = self.inner.write();
        if !allocation.resource.fits_in(&inner.available) {
            return Err(CacheError::NodeNoFit(self.node_id.clone()));
        }
        inner.allocated.add_to(&allocation.resource);
        inner.available.sub_from(&allocation.resource);
        inner.allocations.insert(allocation.uuid, allocation);
        Ok(())
    }

    pub fn remove_allocation(&self, uuid: &Uuid) -> Option<AllocationInfo> {
        let mut inner = self.inner.write();
        let removed = inner.allocations.remove(uuid)?;
        let next = inner.allocated.sub(&removed.resource);
        if next.has_negative() {
            warn!(node = %self.node_id, "allocated total would underflow on release, clamping");
            inner.allocated = inner.allocated.sub_eliminate_negative(&removed.resource);
        } else {
            inner.allocated = next;
        }
        inner.available = inner.capacity.sub_eliminate_negative(&inner.allocated);
        Some(removed)
    }
}

impl std::fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("NodeInfo")
            .field("node_id", &self.node_id)
            .field("capacity", &inner.capacity)
            .field("allocated", &inner.allocated)
            .finish()
    }
}
