//! Scheduling side of an application: its pending asks and in-flight
//! allocation intent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use canopy_cache::ApplicationInfo;
use canopy_common::events::{AllocationAsk, PlacementConstraint};
use canopy_common::resources::Resource;

use crate::errors::SchedulerError;

/// A pending ask. The repeat counter is the only mutable part; everything
/// else is replaced wholesale when the RM updates the ask.
pub struct SchedulingAsk {
    pub allocation_key: String,
    pub application_id: String,
    pub resource: Resource,
    pub priority: i32,
    pub placement_constraint: Option<PlacementConstraint>,
    /// Arrival order within the application, tie-break after priority.
    pub sequence: u64,
    pending_repeat: RwLock<i32>,
}

impl SchedulingAsk {
    fn new(ask: &AllocationAsk, pending: i32, sequence: u64) -> Self {
        Self {
            allocation_key: ask.allocation_key.clone(),
            application_id: ask.application_id.clone(),
            resource: ask.resource.clone(),
            priority: ask.priority,
            placement_constraint: ask.placement_constraint.clone(),
            sequence,
            pending_repeat: RwLock::new(pending),
        }
    }

    pub fn pending_repeat(&self) -> i32 {
        *self.pending_repeat.read()
    }

    /// Apply a delta to the repeat counter. A delta that would drive the
    /// counter negative is refused without mutation.
    pub fn add_pending_repeat(&self, delta: i32) -> bool {
        let mut pending = self.pending_repeat.write();
        if *pending + delta < 0 {
            return false;
        }
        *pending += delta;
        true
    }

    fn set_pending_repeat(&self, value: i32) {
        *self.pending_repeat.write() = value;
    }

    /// Total resource still requested: shape times pending repeats.
    pub fn pending_resource(&self) -> Resource {
        self.resource.multiply(self.pending_repeat() as i64)
    }
}

pub struct SchedulingApplication {
    cached: Arc<ApplicationInfo>,
    inner: RwLock<AppInner>,
}

struct AppInner {
    asks: HashMap<String, Arc<SchedulingAsk>>,
    pending: Resource,
    allocating: Resource,
    next_sequence: u64,
}

impl SchedulingApplication {
    pub fn new(cached: Arc<ApplicationInfo>) -> Self {
        Self {
            cached,
            inner: RwLock::new(AppInner {
                asks: HashMap::new(),
                pending: Resource::new(),
                allocating: Resource::new(),
                next_sequence: 0,
            }),
        }
    }

    pub fn cached(&self) -> &Arc<ApplicationInfo> {
        &self.cached
    }

    pub fn application_id(&self) -> &str {
        self.cached.application_id()
    }

    /// Total pending resource over all asks.
    pub fn pending_resource(&self) -> Resource {
        self.inner.read().pending.clone()
    }

    pub fn allocating_resource(&self) -> Resource {
        self.inner.read().allocating.clone()
    }

    /// Confirmed plus in-flight usage, the fair-share sort key.
    pub fn may_allocated_resource(&self) -> Resource {
        self.cached.allocated_resource().add(&self.allocating_resource())
    }

    /// Add or update an ask. Updating replaces the shape and re-derives the
    /// repeat counter from what is already allocated for the key. Returns
    /// the change in pending resource so the caller can roll it through the
    /// queue hierarchy.
    pub fn update_ask(&self, ask: &AllocationAsk) -> Result<Resource, SchedulerError> {
        if !ask.resource.strictly_greater_than_zero() {
            return Err(SchedulerError::InvalidAsk {
                allocation_key: ask.allocation_key.clone(),
                reason: "ask resource must be positive".to_string(),
            });
        }
        if ask.max_allocations < 0 {
            return Err(SchedulerError::InvalidAsk {
                allocation_key: ask.allocation_key.clone(),
                reason: "max allocations must not be negative".to_string(),
            });
        }
        let already_allocated = self.cached.allocations_for_key(&ask.allocation_key);
        let pending = (ask.max_allocations - already_allocated).max(0);

        let mut inner = self.inner.write();
        let before = match inner.asks.get(&ask.allocation_key) {
            Some(existing) => {
                let before = existing.pending_resource();
                existing.set_pending_repeat(0);
                before
            }
            None => Resource::new(),
        };
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let scheduling_ask = Arc::new(SchedulingAsk::new(ask, pending, sequence));
        let after = scheduling_ask.pending_resource();
        inner
            .asks
            .insert(ask.allocation_key.clone(), scheduling_ask);

        let delta = after.sub(&before);
        inner.pending.add_to(&delta);
        debug!(application = %ask.application_id, allocation_key = %ask.allocation_key,
            pending, "ask updated");
        Ok(delta)
    }

    /// Drop an ask; returns the pending resource it still held.
    pub fn remove_ask(&self, allocation_key: &str) -> Option<Resource> {
        let mut inner = self.inner.write();
        let removed = inner.asks.remove(allocation_key)?;
        let pending = removed.pending_resource();
        inner.pending = inner.pending.sub_eliminate_negative(&pending);
        Some(pending)
    }

    pub fn ask(&self, allocation_key: &str) -> Option<Arc<SchedulingAsk>> {
        self.inner.read().asks.get(allocation_key).cloned()
    }

    /// Asks with outstanding repeats, ordered by priority (descending) then
    /// arrival (ascending).
    pub fn pending_asks(&self) -> Vec<Arc<SchedulingAsk>> {
        let mut asks: Vec<Arc<SchedulingAsk>> = self
            .inner
            .read()
            .asks
            .values()
            .filter(|a| a.pending_repeat() > 0)
            .cloned()
            .collect();
        asks.sort_by(|l, r| {
            r.priority
                .cmp(&l.priority)
                .then(l.sequence.cmp(&r.sequence))
        });
        asks
    }

    pub fn has_pending(&self) -> bool {
        self.inner.read().pending.strictly_greater_than_zero()
    }

    /// Record the intent to allocate one repeat of `ask`. Fails when the
    /// ask has no repeats left.
    pub fn allocate(&self, ask: &SchedulingAsk) -> bool {
        if !ask.add_pending_repeat(-1) {
            return false;
        }
        let mut inner = self.inner.write();
        inner.pending = inner.pending.sub_eliminate_negative(&ask.resource);
        inner.allocating.add_to(&ask.resource);
        true
    }

    /// Undo [`Self::allocate`] when the commit was refused.
    pub fn deallocate(&self, ask: &SchedulingAsk) {
        ask.add_pending_repeat(1);
        let mut inner = self.inner.write();
        inner.pending.add_to(&ask.resource);
        inner.allocating = inner.allocating.sub_eliminate_negative(&ask.resource);
    }

    /// Drain in-flight intent once the commit is applied to the cache.
    pub fn confirm(&self, resource: &Resource) {
        let mut inner = self.inner.write();
        inner.allocating = inner.allocating.sub_eliminate_negative(resource);
    }
}
