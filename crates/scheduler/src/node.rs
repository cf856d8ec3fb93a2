//! Scheduling side of a node: in-flight allocating and preempting amounts
//! on top of the cached capacity accounting.

use std::sync::Arc;

use parking_lot::RwLock;

use canopy_cache::NodeInfo;
use canopy_common::resources::Resource;

pub struct SchedulingNode {
    cached: Arc<NodeInfo>,
    inner: RwLock<NodeInner>,
}

#[derive(Default)]
struct NodeInner {
    /// Committed by the scheduler but not yet applied to the cache.
    allocating: Resource,
    /// Victim resources selected for preemption but not yet released.
    preempting: Resource,
}

impl SchedulingNode {
    pub fn new(cached: Arc<NodeInfo>) -> Self {
        Self {
            cached,
            inner: RwLock::new(NodeInner::default()),
        }
    }

    pub fn cached(&self) -> &Arc<NodeInfo> {
        &self.cached
    }

    pub fn node_id(&self) -> &str {
        self.cached.node_id()
    }

    pub fn allocating_resource(&self) -> Resource {
        self.inner.read().allocating.clone()
    }

    pub fn preempting_resource(&self) -> Resource {
        self.inner.read().preempting.clone()
    }

    /// What the scheduler may still place here: cached available minus the
    /// in-flight allocating amount.
    pub fn allocatable_resource(&self) -> Resource {
        self.cached
            .available_resource()
            .sub_eliminate_negative(&self.allocating_resource())
    }

    /// Resource fit for the normal allocation path. During the preemption
    /// phase resources already marked preempting count as usable.
    pub fn can_allocate(&self, resource: &Resource, preemption_phase: bool) -> bool {
        let mut usable = self.allocatable_resource();
        if preemption_phase {
            usable.add_to(&self.preempting_resource());
        }
        resource.fits_in(&usable)
    }

    pub fn inc_allocating(&self, delta: &Resource) {
        self.inner.write().allocating.add_to(delta);
    }

    pub fn dec_allocating(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        inner.allocating = inner.allocating.sub_eliminate_negative(delta);
    }

    pub fn inc_preempting(&self, delta: &Resource) {
        self.inner.write().preempting.add_to(delta);
    }

    pub fn dec_preempting(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        inner.preempting = inner.preempting.sub_eliminate_negative(delta);
    }
}
