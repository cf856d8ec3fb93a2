//! Scheduling context of one partition: the queue mirror, the application
//! and node twins, the placement chain and the delta handlers the engine
//! drives from the inbound channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use canopy_cache::{AllocationInfo, ApplicationInfo, PartitionInfo};
use canopy_common::events::{
    AddApplication, AllocationAsk, AllocationAskRelease, AllocationRelease, NewNode, UpdatedNode,
};
use canopy_common::security::UserGroup;

use crate::application::SchedulingApplication;
use crate::errors::SchedulerError;
use crate::node::SchedulingNode;
use crate::placement::PlacementManager;
use crate::queue::SchedulingQueue;

pub struct PartitionScheduleContext {
    cache: Arc<PartitionInfo>,
    root: Arc<SchedulingQueue>,
    placement: RwLock<PlacementManager>,
    inner: RwLock<CtxInner>,
    stopped: AtomicBool,
}

#[derive(Default)]
struct CtxInner {
    applications: HashMap<String, Arc<SchedulingApplication>>,
    nodes: HashMap<String, Arc<SchedulingNode>>,
}

impl PartitionScheduleContext {
    pub fn new(cache: Arc<PartitionInfo>) -> Result<Self, SchedulerError> {
        let placement = PlacementManager::from_config(&cache.placement_rules())?;
        let root = SchedulingQueue::from_cache(cache.root());
        Ok(Self {
            cache,
            root,
            placement: RwLock::new(placement),
            inner: RwLock::new(CtxInner::default()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        self.cache.name()
    }

    pub fn rm_id(&self) -> &str {
        self.cache.rm_id()
    }

    pub fn cache(&self) -> &Arc<PartitionInfo> {
        &self.cache
    }

    pub fn root(&self) -> Arc<SchedulingQueue> {
        self.root.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Flag teardown; the scheduling task and the partition manager observe
    /// this at their next tick and exit.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// Called after a configuration reload touched the cached partition:
    /// rebuild the placement chain and reconcile the queue mirror.
    pub fn update_from_config(&self) -> Result<(), SchedulerError> {
        *self.placement.write() = PlacementManager::from_config(&self.cache.placement_rules())?;
        self.root.sync_from_cache();
        info!(partition = %self.name(), "scheduling context refreshed from configuration");
        Ok(())
    }

    // ---- applications ---------------------------------------------------

    /// Run placement for a new application and attach it to its leaf
    /// queue. Any failure leaves no trace of the application behind.
    pub fn add_application(&self, request: &AddApplication) -> Result<(), SchedulerError> {
        let app = Arc::new(ApplicationInfo::new(
            &request.application_id,
            self.name(),
            &request.queue_name,
            request.user.clone(),
            request.tags.clone(),
        ));
        let (queue_name, create) = self.placement.read().place(&app, &self.cache)?;
        self.cache.add_application(app.clone(), &queue_name, create)?;
        self.root.sync_from_cache();

        let scheduling_app = Arc::new(SchedulingApplication::new(app));
        if let Some(leaf) = self.root.find_queue(&queue_name) {
            leaf.add_application(scheduling_app.clone());
        }
        self.inner
            .write()
            .applications
            .insert(request.application_id.clone(), scheduling_app);
        Ok(())
    }

    /// Detach an application; pending asks leave the queue totals and any
    /// placed allocations are released and returned.
    pub fn remove_application(&self, application_id: &str) -> Option<Vec<AllocationInfo>> {
        let scheduling_app = self.inner.write().applications.remove(application_id);
        if let Some(app) = &scheduling_app {
            let pending = app.pending_resource();
            if let Some(leaf) = self.root.find_queue(&app.cached().queue_name()) {
                leaf.remove_application(application_id);
                if pending.strictly_greater_than_zero() {
                    leaf.dec_pending(&pending);
                }
            }
        }
        self.cache.remove_application(application_id)
    }

    pub fn application(&self, application_id: &str) -> Option<Arc<SchedulingApplication>> {
        self.inner.read().applications.get(application_id).cloned()
    }

    // ---- nodes ----------------------------------------------------------

    /// Register a node and replay any allocations the RM reports as
    /// already running on it.
    pub fn add_node(&self, node: &NewNode) -> Result<(), SchedulerError> {
        let cached = self.cache.add_node(node)?;
        self.inner.write().nodes.insert(
            node.node_id.clone(),
            Arc::new(SchedulingNode::new(cached)),
        );
        for alloc in &node.existing_allocations {
            // recovery rebuilds the owning application when it is unknown;
            // the submitting identity is not part of the wire allocation
            let user = UserGroup::new(alloc.application_id.as_str(), vec![]);
            if let Err(e) = self.cache.add_recovered_allocation(alloc, &user) {
                warn!(partition = %self.name(), node = %node.node_id,
                    allocation = %alloc.uuid, error = %e, "failed to recover allocation");
            }
        }
        if !node.existing_allocations.is_empty() {
            self.root.sync_from_cache();
            self.sync_applications_from_cache();
        }
        Ok(())
    }

    pub fn update_node(&self, update: &UpdatedNode) -> Result<(), SchedulerError> {
        self.cache.update_node(update)?;
        Ok(())
    }

    pub fn remove_node(&self, node_id: &str) -> Option<Vec<AllocationInfo>> {
        self.inner.write().nodes.remove(node_id);
        self.cache.remove_node(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<SchedulingNode>> {
        self.inner.read().nodes.get(node_id).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<SchedulingNode>> {
        self.inner.read().nodes.values().cloned().collect()
    }

    /// Mirror twins for applications created outside the normal submission
    /// path (allocation recovery).
    fn sync_applications_from_cache(&self) {
        for app in self.cache.applications() {
            let id = app.application_id().to_string();
            let mut inner = self.inner.write();
            if !inner.applications.contains_key(&id) {
                let scheduling_app = Arc::new(SchedulingApplication::new(app.clone()));
                if let Some(leaf) = self.root.find_queue(&app.queue_name()) {
                    leaf.add_application(scheduling_app.clone());
                }
                inner.applications.insert(id, scheduling_app);
            }
        }
    }

    // ---- asks and releases ----------------------------------------------

    /// Add or update an ask and roll the pending change through the queue
    /// hierarchy.
    pub fn update_ask(&self, ask: &AllocationAsk) -> Result<(), SchedulerError> {
        let app = self
            .application(&ask.application_id)
            .ok_or_else(|| SchedulerError::ApplicationNotFound(ask.application_id.clone()))?;
        let delta = app.update_ask(ask)?;
        if let Some(leaf) = self.root.find_queue(&app.cached().queue_name()) {
            // the delta is signed; adding it keeps the totals exact
            leaf.inc_pending(&delta);
        }
        debug!(partition = %self.name(), application = %ask.application_id,
            allocation_key = %ask.allocation_key, "ask ingested");
        Ok(())
    }

    /// Withdraw a pending ask.
    pub fn release_ask(&self, release: &AllocationAskRelease) {
        let Some(app) = self.application(&release.application_id) else {
            return;
        };
        if let Some(pending) = app.remove_ask(&release.allocation_key) {
            if let Some(leaf) = self.root.find_queue(&app.cached().queue_name()) {
                leaf.dec_pending(&pending);
            }
        }
    }

    /// RM initiated allocation release.
    pub fn release_allocations(&self, release: &AllocationRelease) -> Vec<AllocationInfo> {
        self.cache.release_allocations(release)
    }
}

impl std::fmt::Debug for PartitionScheduleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionScheduleContext")
            .field("partition", &self.name())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_common::config::load_config;
    use canopy_common::resources::Resource;
    use std::collections::HashMap;

    fn ctx() -> PartitionScheduleContext {
        let conf = load_config(
            r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
            resources:
              max: {memory: 1000, vcore: 10}
"#,
        )
        .unwrap();
        let cache = PartitionInfo::from_config(&conf.partitions[0], "rm-1").unwrap();
        PartitionScheduleContext::new(cache).unwrap()
    }

    fn add_app(ctx: &PartitionScheduleContext, id: &str, queue: &str) {
        ctx.add_application(&AddApplication {
            application_id: id.to_string(),
            queue_name: queue.to_string(),
            partition_name: "default".to_string(),
            user: UserGroup::new("alice", vec![]),
            tags: HashMap::new(),
        })
        .unwrap();
    }

    fn ask(app: &str, key: &str, memory: i64, repeats: i32) -> AllocationAsk {
        AllocationAsk {
            allocation_key: key.to_string(),
            application_id: app.to_string(),
            partition_name: "default".to_string(),
            queue_name: String::new(),
            resource: Resource::from_pairs([("memory".to_string(), memory)]),
            priority: 0,
            max_allocations: repeats,
            tags: HashMap::new(),
            placement_constraint: None,
        }
    }

    #[test]
    fn test_application_placement_and_pending_flow() {
        let ctx = ctx();
        add_app(&ctx, "app-1", "root.a");

        ctx.update_ask(&ask("app-1", "k1", 100, 3)).unwrap();
        let leaf = ctx.root().find_queue("root.a").unwrap();
        assert_eq!(leaf.pending_resource().get("memory"), 300);
        assert_eq!(ctx.root().pending_resource().get("memory"), 300);

        // shrink the ask, pending follows
        ctx.update_ask(&ask("app-1", "k1", 100, 1)).unwrap();
        assert_eq!(ctx.root().pending_resource().get("memory"), 100);

        // removal clears what is left
        ctx.remove_application("app-1").unwrap();
        assert!(ctx.root().pending_resource().is_zero());
        assert!(!leaf.has_applications());
    }

    #[test]
    fn test_placement_rejects_unknown_queue() {
        let ctx = ctx();
        let result = ctx.add_application(&AddApplication {
            application_id: "app-1".to_string(),
            queue_name: "root.nosuch".to_string(),
            partition_name: "default".to_string(),
            user: UserGroup::new("alice", vec![]),
            tags: HashMap::new(),
        });
        assert!(result.is_err());
        assert!(ctx.application("app-1").is_none());
        assert!(ctx.cache().get_application("app-1").is_none());
    }

    #[test]
    fn test_ask_for_unknown_application() {
        let ctx = ctx();
        assert!(matches!(
            ctx.update_ask(&ask("ghost", "k1", 100, 1)),
            Err(SchedulerError::ApplicationNotFound(_))
        ));
    }

    #[test]
    fn test_release_ask_clears_pending() {
        let ctx = ctx();
        add_app(&ctx, "app-1", "root.a");
        ctx.update_ask(&ask("app-1", "k1", 100, 2)).unwrap();
        ctx.release_ask(&AllocationAskRelease {
            partition_name: "default".to_string(),
            application_id: "app-1".to_string(),
            allocation_key: "k1".to_string(),
            message: String::new(),
        });
        assert!(ctx.root().pending_resource().is_zero());
    }
}
