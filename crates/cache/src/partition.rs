//! A partition: one scheduling domain owning a queue tree, an application
//! index and a node index.
//!
//! All structural changes (nodes joining, applications arriving, proposals
//! committing) happen through the partition so that totals, the root max
//! and the per-queue allocated chains stay consistent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use canopy_common::config::{PartitionConfig, PlacementRuleConfig, UserLimitConfig};
use canopy_common::events::{Allocation, AllocationRelease, NewNode, UpdatedNode};
use canopy_common::resources::Resource;
use canopy_common::security::UserGroup;
use canopy_common::{normalized_partition_name, DOT, ROOT_QUEUE};

use crate::allocation::AllocationInfo;
use crate::application::{ApplicationEvent, ApplicationInfo};
use crate::errors::CacheError;
use crate::node::NodeInfo;
use crate::queue::QueueInfo;

/// An allocation the scheduler wants to commit. The cache assigns the uuid
/// at commit time, under the partition lock.
#[derive(Clone, Debug)]
pub struct AllocationProposal {
    pub allocation_key: String,
    pub application_id: String,
    pub queue_name: String,
    pub node_id: String,
    pub resource: Resource,
    pub priority: i32,
    pub tags: HashMap<String, String>,
}

pub struct PartitionInfo {
    name: String,
    rm_id: String,
    root: Arc<QueueInfo>,
    inner: RwLock<PartitionInner>,
}

struct PartitionInner {
    applications: HashMap<String, Arc<ApplicationInfo>>,
    nodes: HashMap<String, Arc<NodeInfo>>,
    total: Resource,
    preemption_enabled: bool,
    placement_rules: Vec<PlacementRuleConfig>,
    user_limits: HashMap<String, UserLimitConfig>,
}

impl PartitionInfo {
    /// Build a partition from one validated partition config block.
    pub fn from_config(conf: &PartitionConfig, rm_id: &str) -> Result<Arc<Self>, CacheError> {
        let root = QueueInfo::from_config(&conf.queues[0])?;
        let partition = Arc::new(Self {
            name: normalized_partition_name(&conf.name, rm_id),
            rm_id: rm_id.to_string(),
            root,
            inner: RwLock::new(PartitionInner {
                applications: HashMap::new(),
                nodes: HashMap::new(),
                total: Resource::new(),
                preemption_enabled: conf.preemption.enabled,
                placement_rules: conf.placement_rules.clone(),
                user_limits: conf
                    .users
                    .iter()
                    .map(|u| (u.name.clone(), u.clone()))
                    .collect(),
            }),
        });
        info!(partition = %partition.name, "created partition");
        Ok(partition)
    }

    /// Apply a new configuration to this partition: queue limits and
    /// properties are refreshed, new managed queues appear, managed queues
    /// dropped from the config start draining. Unmanaged queues are left to
    /// the partition manager.
    pub fn update_config(&self, conf: &PartitionConfig) -> Result<(), CacheError> {
        update_queue_recursive(&conf.queues[0], &self.root)?;
        let mut inner = self.inner.write();
        inner.preemption_enabled = conf.preemption.enabled;
        inner.placement_rules = conf.placement_rules.clone();
        inner.user_limits = conf
            .users
            .iter()
            .map(|u| (u.name.clone(), u.clone()))
            .collect();
        info!(partition = %self.name, "applied configuration update");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rm_id(&self) -> &str {
        &self.rm_id
    }

    pub fn root(&self) -> Arc<QueueInfo> {
        self.root.clone()
    }

    pub fn preemption_enabled(&self) -> bool {
        self.inner.read().preemption_enabled
    }

    pub fn placement_rules(&self) -> Vec<PlacementRuleConfig> {
        self.inner.read().placement_rules.clone()
    }

    /// Sum of the registered node capacities.
    pub fn total_resource(&self) -> Resource {
        self.inner.read().total.clone()
    }

    pub fn get_queue(&self, path: &str) -> Option<Arc<QueueInfo>> {
        self.root.get_queue(path)
    }

    /// Create the unmanaged queues needed so that `path` exists: missing
    /// intermediate segments become unmanaged parents, the last segment an
    /// unmanaged leaf. Fails when the path runs through an existing leaf.
    pub fn create_queues(&self, path: &str) -> Result<Arc<QueueInfo>, CacheError> {
        if let Some(queue) = self.get_queue(path) {
            return Ok(queue);
        }
        let rest = path
            .strip_prefix(&format!("{ROOT_QUEUE}{DOT}"))
            .ok_or_else(|| CacheError::QueueNotFound(path.to_string()))?;
        let segments: Vec<&str> = rest.split(DOT).collect();
        let mut current = self.root.clone();
        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;
            current = match current.child(segment) {
                Some(existing) => {
                    if existing.is_leaf() && !is_last {
                        return Err(CacheError::QueueNotParent(existing.path().to_string()));
                    }
                    existing
                }
                None => QueueInfo::new_dynamic(segment, &current, is_last)?,
            };
        }
        Ok(current)
    }

    // ---- nodes ----------------------------------------------------------

    /// Register a node, grow the partition total and the root max with its
    /// capacity.
    pub fn add_node(&self, node: &NewNode) -> Result<Arc<NodeInfo>, CacheError> {
        let info = Arc::new(NodeInfo::new(node));
        {
            let mut inner = self.inner.write();
            if inner.nodes.contains_key(&node.node_id) {
                return Err(CacheError::NodeExists(node.node_id.clone()));
            }
            inner.nodes.insert(node.node_id.clone(), info.clone());
            inner.total.add_to(&node.capacity);
            self.root.set_max_resource(inner.total.clone());
        }
        debug!(partition = %self.name, node = %node.node_id, capacity = %node.capacity, "added node");
        Ok(info)
    }

    pub fn update_node(&self, update: &UpdatedNode) -> Result<(), CacheError> {
        let node = self
            .get_node(&update.node_id)
            .ok_or_else(|| CacheError::NodeNotFound(update.node_id.clone()))?;
        let before = node.capacity();
        node.update(update);
        let after = node.capacity();
        if before != after {
            let mut inner = self.inner.write();
            inner.total.sub_from(&before);
            inner.total.add_to(&after);
            self.root.set_max_resource(inner.total.clone());
        }
        Ok(())
    }

    /// Drop a node. Allocations still on the node are released from their
    /// applications and queues; the released records are returned so the
    /// caller can notify the RM.
    pub fn remove_node(&self, node_id: &str) -> Option<Vec<AllocationInfo>> {
        let node = {
            let mut inner = self.inner.write();
            let node = inner.nodes.remove(node_id)?;
            inner.total.sub_from(&node.capacity());
            self.root.set_max_resource(inner.total.clone());
            node
        };
        let mut released = Vec::new();
        for allocation in node.allocations() {
            node.remove_allocation(&allocation.uuid);
            if let Some(app) = self.get_application(&allocation.application_id) {
                app.remove_allocation(&allocation.uuid);
            }
            if let Some(queue) = self.get_queue(&allocation.queue_name) {
                queue.dec_allocated(&allocation.resource);
            }
            released.push(allocation);
        }
        info!(partition = %self.name, node = %node_id, released = released.len(), "removed node");
        Some(released)
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<NodeInfo>> {
        self.inner.read().nodes.get(node_id).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<NodeInfo>> {
        self.inner.read().nodes.values().cloned().collect()
    }

    // ---- applications ---------------------------------------------------

    /// Attach an application to the leaf queue placement decided on. The
    /// queue is created unmanaged when `create` is set and it does not
    /// exist yet.
    pub fn add_application(
        &self,
        app: Arc<ApplicationInfo>,
        queue_name: &str,
        create: bool,
    ) -> Result<(), CacheError> {
        let app_id = app.application_id().to_string();
        {
            let inner = self.inner.read();
            if inner.applications.contains_key(&app_id) {
                return Err(CacheError::ApplicationExists(app_id));
            }
            if let Some(limit) = inner
                .user_limits
                .get(&app.user().user)
                .and_then(|l| l.max_applications)
            {
                let running = inner
                    .applications
                    .values()
                    .filter(|a| a.user().user == app.user().user && a.is_schedulable())
                    .count() as u64;
                if running >= limit {
                    return Err(CacheError::UserLimitExceeded {
                        user: app.user().user.clone(),
                        limit,
                    });
                }
            }
        }

        let queue = match self.get_queue(queue_name) {
            Some(queue) => queue,
            None if create => self.create_queues(queue_name)?,
            None => return Err(CacheError::QueueNotFound(queue_name.to_string())),
        };
        queue.add_application(&app_id, app.user())?;
        app.set_queue(queue.path());
        app.handle_event(ApplicationEvent::Accept)?;
        self.inner.write().applications.insert(app_id, app);
        Ok(())
    }

    /// Remove an application; its allocations are released everywhere and
    /// returned.
    pub fn remove_application(&self, application_id: &str) -> Option<Vec<AllocationInfo>> {
        let app = self.inner.write().applications.remove(application_id)?;
        if let Some(queue) = self.get_queue(&app.queue_name()) {
            queue.remove_application(application_id);
        }
        let mut released = Vec::new();
        for allocation in app.remove_all_allocations() {
            if let Some(node) = self.get_node(&allocation.node_id) {
                node.remove_allocation(&allocation.uuid);
            }
            if let Some(queue) = self.get_queue(&allocation.queue_name) {
                queue.dec_allocated(&allocation.resource);
            }
            released.push(allocation);
        }
        debug!(partition = %self.name, application = %application_id, "removed application");
        Some(released)
    }

    pub fn get_application(&self, application_id: &str) -> Option<Arc<ApplicationInfo>> {
        self.inner.read().applications.get(application_id).cloned()
    }

    pub fn applications(&self) -> Vec<Arc<ApplicationInfo>> {
        self.inner.read().applications.values().cloned().collect()
    }

    // ---- allocations ----------------------------------------------------

    /// Commit a proposal: assign the uuid, grow the queue chain, place on
    /// the node and index on the application. Rolls back completely when
    /// any step refuses.
    pub fn add_allocation(
        &self,
        proposal: &AllocationProposal,
    ) -> Result<AllocationInfo, CacheError> {
        let app = self
            .get_application(&proposal.application_id)
            .ok_or_else(|| CacheError::ApplicationNotFound(proposal.application_id.clone()))?;
        let queue = self
            .get_queue(&proposal.queue_name)
            .ok_or_else(|| CacheError::QueueNotFound(proposal.queue_name.clone()))?;
        let node = self
            .get_node(&proposal.node_id)
            .ok_or_else(|| CacheError::NodeNotFound(proposal.node_id.clone()))?;

        let allocation = AllocationInfo {
            uuid: Uuid::new_v4(),
            allocation_key: proposal.allocation_key.clone(),
            application_id: proposal.application_id.clone(),
            node_id: proposal.node_id.clone(),
            queue_name: queue.path().to_string(),
            partition_name: self.name.clone(),
            resource: proposal.resource.clone(),
            priority: proposal.priority,
            tags: proposal.tags.clone(),
        };

        queue.inc_allocated(&allocation.resource)?;
        if let Err(e) = node.add_allocation(allocation.clone()) {
            queue.dec_allocated(&allocation.resource);
            return Err(e);
        }
        app.add_allocation(allocation.clone());
        debug!(partition = %self.name, allocation = %allocation, "committed allocation");
        Ok(allocation)
    }

    /// Re-index an allocation reported by the RM on re-registration. The
    /// application and queue are rebuilt as needed; the original uuid is
    /// kept.
    pub fn add_recovered_allocation(
        &self,
        alloc: &Allocation,
        user: &UserGroup,
    ) -> Result<AllocationInfo, CacheError> {
        if self.get_application(&alloc.application_id).is_none() {
            let app = Arc::new(ApplicationInfo::new(
                &alloc.application_id,
                &self.name,
                &alloc.queue_name,
                user.clone(),
                alloc.tags.clone(),
            ));
            self.add_application(app, &alloc.queue_name, true)?;
        }
        let app = self
            .get_application(&alloc.application_id)
            .ok_or_else(|| CacheError::ApplicationNotFound(alloc.application_id.clone()))?;
        let queue = self.create_queues(&alloc.queue_name)?;
        let node = self
            .get_node(&alloc.node_id)
            .ok_or_else(|| CacheError::NodeNotFound(alloc.node_id.clone()))?;

        let info = AllocationInfo::from_event(alloc);
        queue.inc_allocated(&info.resource)?;
        if let Err(e) = node.add_allocation(info.clone()) {
            queue.dec_allocated(&info.resource);
            return Err(e);
        }
        app.add_allocation(info.clone());
        info!(partition = %self.name, allocation = %info, "recovered allocation");
        Ok(info)
    }

    /// Release allocations named by an RM release request. A missing uuid
    /// releases everything the application holds.
    pub fn release_allocations(&self, release: &AllocationRelease) -> Vec<AllocationInfo> {
        let targets: Vec<AllocationInfo> = match release.uuid {
            Some(uuid) => self
                .applications()
                .iter()
                .find_map(|app| app.remove_allocation(&uuid))
                .into_iter()
                .collect(),
            None => match self.get_application(&release.application_id) {
                Some(app) => app.remove_all_allocations(),
                None => {
                    warn!(partition = %self.name, application = %release.application_id,
                        "release for unknown application");
                    Vec::new()
                }
            },
        };
        for allocation in &targets {
            if let Some(node) = self.get_node(&allocation.node_id) {
                node.remove_allocation(&allocation.uuid);
            }
            if let Some(queue) = self.get_queue(&allocation.queue_name) {
                queue.dec_allocated(&allocation.resource);
            }
        }
        targets
    }
}

fn update_queue_recursive(
    conf: &canopy_common::config::QueueConfig,
    queue: &Arc<QueueInfo>,
) -> Result<(), CacheError> {
    queue.apply_config(conf)?;
    let configured: Vec<&str> = conf.queues.iter().map(|c| c.name.as_str()).collect();
    for child_conf in &conf.queues {
        match queue.child(&child_conf.name) {
            Some(child) => update_queue_recursive(child_conf, &child)?,
            None => QueueInfo::managed_child_from_config(child_conf, queue)?,
        }
    }
    for child in queue.children() {
        if child.is_managed() && !configured.contains(&child.name()) {
            info!(queue = %child.path(), "managed queue dropped from configuration, draining");
            child.mark_for_removal();
        }
    }
    Ok(())
}

impl std::fmt::Debug for PartitionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionInfo")
            .field("name", &self.name)
            .field("rm_id", &self.rm_id)
            .finish()
    }
}
