//! Scheduling side of a queue.
//!
//! Each cache queue has a scheduling twin holding the transient amounts the
//! allocation loop works with: pending asks below the queue, in-flight
//! proposing/allocating totals, and resources marked preempted but not yet
//! released. These drain back to zero once proposals are confirmed or
//! withdrawn; the cached queue keeps the RM-confirmed truth.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::warn;

use canopy_cache::queue::ApplicationSortPolicy;
use canopy_cache::QueueInfo;
use canopy_common::resources::Resource;
use canopy_common::DOT;

use crate::application::SchedulingApplication;
use crate::sorters::SortPolicy;

pub struct SchedulingQueue {
    cached: Arc<QueueInfo>,
    parent: Weak<SchedulingQueue>,
    inner: RwLock<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    children: HashMap<String, Arc<SchedulingQueue>>,
    applications: HashMap<String, Arc<SchedulingApplication>>,
    /// Sum of pending ask resources at and below this queue.
    pending: Resource,
    /// In-flight proposals counted for fair-share ordering.
    proposing: Resource,
    /// In-flight proposals counted against headroom.
    allocating: Resource,
    /// Victim resources selected below this queue, not yet released.
    marked_preempted: Resource,
}

impl SchedulingQueue {
    /// Build the scheduling twin of a cache queue tree.
    pub fn from_cache(cached: Arc<QueueInfo>) -> Arc<Self> {
        let root = Self::new(cached, Weak::new());
        root.sync_from_cache();
        root
    }

    fn new(cached: Arc<QueueInfo>, parent: Weak<SchedulingQueue>) -> Arc<Self> {
        Arc::new(Self {
            cached,
            parent,
            inner: RwLock::new(QueueInner::default()),
        })
    }

    /// Reconcile the mirror with the cache: twins appear for new cache
    /// queues and disappear for removed ones. Existing twins keep their
    /// transient state.
    pub fn sync_from_cache(self: &Arc<Self>) {
        let cached_children: HashMap<String, Arc<QueueInfo>> = self
            .cached
            .children()
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        {
            let mut inner = self.inner.write();
            inner
                .children
                .retain(|name, _| cached_children.contains_key(name));
            for (name, cache_child) in &cached_children {
                inner
                    .children
                    .entry(name.clone())
                    .or_insert_with(|| Self::new(cache_child.clone(), Arc::downgrade(self)));
            }
        }
        for child in self.children() {
            child.sync_from_cache();
        }
    }

    pub fn cached(&self) -> &Arc<QueueInfo> {
        &self.cached
    }

    pub fn path(&self) -> &str {
        self.cached.path()
    }

    pub fn is_leaf(&self) -> bool {
        self.cached.is_leaf()
    }

    pub fn is_managed(&self) -> bool {
        self.cached.is_managed()
    }

    /// Draining and stopped queues are skipped by the allocation loop.
    pub fn is_schedulable(&self) -> bool {
        self.cached.is_running()
    }

    pub fn parent(&self) -> Option<Arc<SchedulingQueue>> {
        self.parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<SchedulingQueue>> {
        self.inner.read().children.values().cloned().collect()
    }

    pub fn child(&self, name: &str) -> Option<Arc<SchedulingQueue>> {
        self.inner.read().children.get(name).cloned()
    }

    pub fn has_children(&self) -> bool {
        !self.inner.read().children.is_empty()
    }

    pub(crate) fn remove_child(&self, name: &str) {
        self.inner.write().children.remove(name);
    }

    /// Resolve a descendant twin by fully qualified path.
    pub fn find_queue(self: &Arc<Self>, path: &str) -> Option<Arc<SchedulingQueue>> {
        if path == self.path() {
            return Some(self.clone());
        }
        let prefix = format!("{}{DOT}", self.path());
        let rest = path.strip_prefix(&prefix)?;
        let mut current = self.clone();
        for segment in rest.split(DOT) {
            let next = current.child(segment)?;
            current = next;
        }
        Some(current)
    }

    // ---- applications ---------------------------------------------------

    pub fn add_application(&self, app: Arc<SchedulingApplication>) {
        self.inner
            .write()
            .applications
            .insert(app.application_id().to_string(), app);
    }

    pub fn remove_application(&self, application_id: &str) -> Option<Arc<SchedulingApplication>> {
        self.inner.write().applications.remove(application_id)
    }

    pub fn applications(&self) -> Vec<Arc<SchedulingApplication>> {
        self.inner.read().applications.values().cloned().collect()
    }

    pub fn has_applications(&self) -> bool {
        !self.inner.read().applications.is_empty()
    }

    // ---- sort policies --------------------------------------------------

    pub fn application_sort_policy(&self) -> SortPolicy {
        match self.cached.application_sort_policy() {
            ApplicationSortPolicy::Fair => SortPolicy::Fair,
            ApplicationSortPolicy::Fifo => SortPolicy::Fifo,
        }
    }

    pub fn queue_sort_policy(&self) -> SortPolicy {
        SortPolicy::Fair
    }

    // ---- transient resources --------------------------------------------

    pub fn pending_resource(&self) -> Resource {
        self.inner.read().pending.clone()
    }

    pub fn allocating_resource(&self) -> Resource {
        self.inner.read().allocating.clone()
    }

    pub fn proposing_resource(&self) -> Resource {
        self.inner.read().proposing.clone()
    }

    pub fn marked_preempted_resource(&self) -> Resource {
        self.inner.read().marked_preempted.clone()
    }

    /// Confirmed plus in-flight usage, the fair-share sort key for queues.
    pub fn proposed_usage(&self) -> Resource {
        self.cached
            .allocated_resource()
            .add(&self.proposing_resource())
    }

    /// Confirmed plus in-flight usage counted against limits.
    pub fn may_allocated(&self) -> Resource {
        self.cached
            .allocated_resource()
            .add(&self.allocating_resource())
    }

    /// Add pending resource here and on every ancestor.
    pub fn inc_pending(&self, delta: &Resource) {
        if let Some(parent) = self.parent() {
            parent.inc_pending(delta);
        }
        self.inner.write().pending.add_to(delta);
    }

    /// Remove pending resource here and on every ancestor. Never drives a
    /// total negative: underflow is clamped per dimension and logged.
    pub fn dec_pending(&self, delta: &Resource) {
        if let Some(parent) = self.parent() {
            parent.dec_pending(delta);
        }
        let mut inner = self.inner.write();
        let next = inner.pending.sub(delta);
        if next.has_negative() {
            warn!(queue = %self.path(), delta = %delta, pending = %inner.pending,
                "pending resource would underflow, clamping to zero");
            inner.pending = inner.pending.sub_eliminate_negative(delta);
        } else {
            inner.pending = next;
        }
    }

    /// Record in-flight intent here and on every ancestor.
    pub fn inc_allocating(&self, delta: &Resource) {
        if let Some(parent) = self.parent() {
            parent.inc_allocating(delta);
        }
        let mut inner = self.inner.write();
        inner.allocating.add_to(delta);
        inner.proposing.add_to(delta);
    }

    /// Drain in-flight intent here and on every ancestor.
    pub fn dec_allocating(&self, delta: &Resource) {
        if let Some(parent) = self.parent() {
            parent.dec_allocating(delta);
        }
        let mut inner = self.inner.write();
        inner.allocating = inner.allocating.sub_eliminate_negative(delta);
        inner.proposing = inner.proposing.sub_eliminate_negative(delta);
    }

    pub fn inc_marked_preempted(&self, delta: &Resource) {
        self.inner.write().marked_preempted.add_to(delta);
    }

    pub fn dec_marked_preempted(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        inner.marked_preempted = inner.marked_preempted.sub_eliminate_negative(delta);
    }

    /// Remaining room on the path from here to the root: the componentwise
    /// minimum of `max - allocated - allocating` over every ancestor with a
    /// max limit. `None` means nothing on the path is limited.
    pub fn headroom(self: &Arc<Self>) -> Option<Resource> {
        let mut headroom: Option<Resource> = None;
        let mut current = Some(self.clone());
        while let Some(queue) = current {
            if let Some(max) = queue.cached.max_resource() {
                let room = max.sub(&queue.may_allocated());
                headroom = Some(match headroom {
                    Some(h) => h.component_wise_min(&room),
                    None => room,
                });
            }
            current = queue.parent();
        }
        headroom
    }
}

impl std::fmt::Debug for SchedulingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingQueue")
            .field("path", &self.path())
            .field("pending", &self.pending_resource())
            .field("allocating", &self.allocating_resource())
            .finish()
    }
}
