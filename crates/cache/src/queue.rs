//! The authoritative queue hierarchy.
//!
//! Queues form a tree below a single root. The parent pointer is a weak
//! back-reference only: removal clears the child entry in the parent and
//! never touches the pointer in the child. Each queue guards its own fields
//! with a read-write lock; operations that cross queues (allocated totals
//! along the ancestor chain) take the locks parent before child.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, warn};

use canopy_common::config::{QueueConfig, APPLICATION_SORT_POLICY};
use canopy_common::resources::Resource;
use canopy_common::security::{Acl, UserGroup};
use canopy_common::{DOT, ROOT_QUEUE};

use crate::errors::CacheError;

/// Lifecycle of a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting applications and scheduling.
    Running,
    /// Existing allocations drain out, nothing new comes in; the partition
    /// manager removes the queue once it is empty.
    Draining,
    /// Present but not accepting applications.
    Stopped,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueState::Running => write!(f, "Running"),
            QueueState::Draining => write!(f, "Draining"),
            QueueState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// How a leaf orders its applications.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApplicationSortPolicy {
    #[default]
    Fifo,
    Fair,
}

pub struct QueueInfo {
    name: String,
    path: String,
    leaf: bool,
    managed: bool,
    parent: Weak<QueueInfo>,
    inner: RwLock<QueueInner>,
}

struct QueueInner {
    state: QueueState,
    guaranteed: Resource,
    max: Option<Resource>,
    allocated: Resource,
    properties: HashMap<String, String>,
    submit_acl: Option<Acl>,
    admin_acl: Option<Acl>,
    max_applications: Option<u64>,
    children: HashMap<String, Arc<QueueInfo>>,
    applications: HashSet<String>,
}

impl QueueInfo {
    /// Build the managed queue tree from a validated configuration. The
    /// passed config must be the partition's root queue.
    pub fn from_config(conf: &QueueConfig) -> Result<Arc<QueueInfo>, CacheError> {
        let root = Self::new(ROOT_QUEUE, None, conf.queues.is_empty() && !conf.parent, true);
        root.apply_config(conf)?;
        for child in &conf.queues {
            Self::managed_child_from_config(child, &root)?;
        }
        Ok(root)
    }

    /// Build a managed subtree from configuration below `parent`. Used at
    /// partition build time and when a reload introduces new queues.
    pub(crate) fn managed_child_from_config(
        conf: &QueueConfig,
        parent: &Arc<QueueInfo>,
    ) -> Result<(), CacheError> {
        let leaf = conf.queues.is_empty() && !conf.parent;
        let queue = Self::new(&conf.name, Some(parent), leaf, true);
        queue.apply_config(conf)?;
        parent
            .inner
            .write()
            .children
            .insert(conf.name.clone(), queue.clone());
        for child in &conf.queues {
            Self::managed_child_from_config(child, &queue)?;
        }
        Ok(())
    }

    /// Create an unmanaged queue below `parent`, as done by placement rules
    /// with the create flag set.
    pub fn new_dynamic(
        name: &str,
        parent: &Arc<QueueInfo>,
        leaf: bool,
    ) -> Result<Arc<QueueInfo>, CacheError> {
        if parent.is_leaf() {
            return Err(CacheError::QueueNotParent(parent.path.clone()));
        }
        let queue = Self::new(name, Some(parent), leaf, false);
        parent
            .inner
            .write()
            .children
            .insert(name.to_string(), queue.clone());
        debug!(queue = %queue.path, leaf, "created unmanaged queue");
        Ok(queue)
    }

    fn new(name: &str, parent: Option<&Arc<QueueInfo>>, leaf: bool, managed: bool) -> Arc<Self> {
        let path = match parent {
            Some(p) => format!("{}{DOT}{name}", p.path),
            None => name.to_string(),
        };
        Arc::new(QueueInfo {
            name: name.to_string(),
            path,
            leaf,
            managed,
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            inner: RwLock::new(QueueInner {
                state: QueueState::Running,
                guaranteed: Resource::new(),
                max: None,
                allocated: Resource::new(),
                properties: HashMap::new(),
                submit_acl: None,
                admin_acl: None,
                max_applications: None,
                children: HashMap::new(),
                applications: HashSet::new(),
            }),
        })
    }

    /// Apply configured limits, ACLs and properties. Used at build time and
    /// again on a configuration reload.
    pub fn apply_config(&self, conf: &QueueConfig) -> Result<(), CacheError> {
        let submit_acl = conf.submit_acl.as_deref().map(Acl::parse).transpose()?;
        let admin_acl = conf.admin_acl.as_deref().map(Acl::parse).transpose()?;
        let mut inner = self.inner.write();
        inner.guaranteed = conf.resources.guaranteed_resource();
        if !self.is_root() {
            let max = conf.resources.max_resource();
            inner.max = if max.is_zero() { None } else { Some(max) };
        }
        inner.properties = conf.properties.clone();
        inner.submit_acl = submit_acl;
        inner.admin_acl = admin_acl;
        inner.max_applications = conf.max_applications;
        // a reload revives a queue that was marked draining earlier
        if inner.state == QueueState::Draining {
            inner.state = QueueState::Running;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified, dot separated, root prefixed path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn is_root(&self) -> bool {
        self.parent.upgrade().is_none() && self.path == ROOT_QUEUE
    }

    pub fn parent(&self) -> Option<Arc<QueueInfo>> {
        self.parent.upgrade()
    }

    pub fn state(&self) -> QueueState {
        self.inner.read().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == QueueState::Running
    }

    pub fn is_draining(&self) -> bool {
        self.state() == QueueState::Draining
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == QueueState::Stopped
    }

    pub fn stop(&self) {
        self.inner.write().state = QueueState::Stopped;
    }

    pub fn guaranteed_resource(&self) -> Resource {
        self.inner.read().guaranteed.clone()
    }

    /// Configured max; `None` means unlimited. For the root this is the
    /// partition total maintained by the partition as nodes join and leave.
    pub fn max_resource(&self) -> Option<Resource> {
        self.inner.read().max.clone()
    }

    /// Only the partition may call this, and only on the root.
    pub fn set_max_resource(&self, max: Resource) {
        debug_assert!(self.is_root());
        self.inner.write().max = Some(max);
    }

    pub fn allocated_resource(&self) -> Resource {
        self.inner.read().allocated.clone()
    }

    pub fn properties(&self) -> HashMap<String, String> {
        self.inner.read().properties.clone()
    }

    /// Leaf application-sort policy from the queue properties; unknown
    /// values fall back to the default.
    pub fn application_sort_policy(&self) -> ApplicationSortPolicy {
        match self
            .inner
            .read()
            .properties
            .get(APPLICATION_SORT_POLICY)
            .map(String::as_str)
        {
            Some("fair") => ApplicationSortPolicy::Fair,
            Some("fifo") | None => ApplicationSortPolicy::Fifo,
            Some(other) => {
                debug!(queue = %self.path, policy = other, "unknown application sort policy, using fifo");
                ApplicationSortPolicy::Fifo
            }
        }
    }

    pub fn children(&self) -> Vec<Arc<QueueInfo>> {
        self.inner.read().children.values().cloned().collect()
    }

    pub fn child(&self, name: &str) -> Option<Arc<QueueInfo>> {
        self.inner.read().children.get(name).cloned()
    }

    pub fn has_children(&self) -> bool {
        !self.inner.read().children.is_empty()
    }

    pub fn application_count(&self) -> usize {
        self.inner.read().applications.len()
    }

    /// Resolve a descendant by its fully qualified path. `path` must equal
    /// this queue's path or extend it.
    pub fn get_queue(self: &Arc<Self>, path: &str) -> Option<Arc<QueueInfo>> {
        if path == self.path {
            return Some(self.clone());
        }
        let rest = path.strip_prefix(&format!("{}{DOT}", self.path))?;
        let mut current = self.clone();
        for segment in rest.split(DOT) {
            let next = current.child(segment)?;
            current = next;
        }
        Some(current)
    }

    /// Whether the user may submit to this queue: the submit ACL or the
    /// admin ACL must allow; a queue with neither configured is open.
    pub fn check_submit_access(&self, user: &UserGroup) -> bool {
        let inner = self.inner.read();
        match (&inner.submit_acl, &inner.admin_acl) {
            (None, None) => true,
            (submit, admin) => {
                submit.as_ref().is_some_and(|acl| acl.allows(user))
                    || admin.as_ref().is_some_and(|acl| acl.allows(user))
            }
        }
    }

    pub fn check_admin_access(&self, user: &UserGroup) -> bool {
        let inner = self.inner.read();
        inner.admin_acl.as_ref().is_some_and(|acl| acl.allows(user))
    }

    /// Register an application on this leaf. Fails when the queue is not a
    /// leaf, not running, over its application cap, or the ACL denies.
    pub fn add_application(&self, application_id: &str, user: &UserGroup) -> Result<(), CacheError> {
        if !self.leaf {
            return Err(CacheError::QueueNotLeaf(self.path.clone()));
        }
        if !self.is_running() {
            return Err(CacheError::QueueNotRunning(
                self.path.clone(),
                self.state().to_string(),
            ));
        }
        if !self.check_submit_access(user) {
            return Err(CacheError::AclDeny {
                user: user.user.clone(),
                queue: self.path.clone(),
            });
        }
        let mut inner = self.inner.write();
        if let Some(limit) = inner.max_applications {
            if inner.applications.len() as u64 >= limit {
                return Err(CacheError::QueueNotRunning(
                    self.path.clone(),
                    format!("application limit {limit} reached"),
                ));
            }
        }
        inner.applications.insert(application_id.to_string());
        Ok(())
    }

    pub fn remove_application(&self, application_id: &str) {
        self.inner.write().applications.remove(application_id);
    }

    /// The ancestor chain from this queue up to and including the root.
    fn chain(self: &Arc<Self>) -> Vec<Arc<QueueInfo>> {
        let mut chain = vec![self.clone()];
        let mut current = self.parent();
        while let Some(q) = current {
            current = q.parent();
            chain.push(q);
        }
        chain
    }

    /// Add `delta` to the allocated total of this queue and every ancestor.
    /// The whole chain is checked against the configured max limits and
    /// committed under one critical section: the write locks are taken
    /// root first and held until the commit, so two concurrent increments
    /// cannot both pass the same headroom. Nothing is mutated when any
    /// queue on the path would overflow.
    pub fn inc_allocated(self: &Arc<Self>, delta: &Resource) -> Result<(), CacheError> {
        let chain = self.chain();
        let mut guards = Vec::with_capacity(chain.len());
        for queue in chain.iter().rev() {
            guards.push(queue.inner.write());
        }
        for (queue, guard) in chain.iter().rev().zip(guards.iter()) {
            if let Some(max) = &guard.max {
                if !guard.allocated.add(delta).fits_in(max) {
                    return Err(CacheError::QueueMaxExceeded(queue.path.clone()));
                }
            }
        }
        for guard in guards.iter_mut() {
            guard.allocated.add_to(delta);
        }
        Ok(())
    }

    /// Remove `delta` from this queue and every ancestor. Totals never go
    /// negative: a release that would underflow is clamped per dimension.
    pub fn dec_allocated(self: &Arc<Self>, delta: &Resource) {
        for queue in self.chain().iter().rev() {
            let mut inner = queue.inner.write();
            let next = inner.allocated.sub(delta);
            if next.has_negative() {
                warn!(queue = %queue.path, delta = %delta, allocated = %inner.allocated,
                    "allocated total would underflow, clamping to zero");
                inner.allocated = inner.allocated.sub_eliminate_negative(delta);
            } else {
                inner.allocated = next;
            }
        }
    }

    /// Recursively mark this queue and everything below it as draining.
    /// Draining queues accept no new applications and are removed by the
    /// partition manager once empty.
    pub fn mark_for_removal(&self) {
        {
            let mut inner = self.inner.write();
            inner.state = QueueState::Draining;
        }
        for child in self.children() {
            child.mark_for_removal();
        }
    }

    /// Remove this queue from its parent. Refused for the root, for
    /// managed queues still running, and for queues that are not empty.
    pub fn remove_queue(self: &Arc<Self>) -> bool {
        let Some(parent) = self.parent() else {
            return false;
        };
        // parent lock before own lock, as everywhere on the chain
        let mut parent_inner = parent.inner.write();
        {
            let inner = self.inner.read();
            if self.managed && inner.state == QueueState::Running {
                return false;
            }
            if !inner.children.is_empty() || !inner.applications.is_empty() {
                return false;
            }
            if inner.allocated.strictly_greater_than_zero() {
                return false;
            }
        }
        parent_inner.children.remove(&self.name);
        debug!(queue = %self.path, "removed queue");
        true
    }
}

impl std::fmt::Debug for QueueInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueInfo")
            .field("path", &self.path)
            .field("leaf", &self.leaf)
            .field("managed", &self.managed)
            .field("state", &self.state())
            .finish()
    }
}
