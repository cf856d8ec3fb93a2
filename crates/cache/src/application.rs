//! Application records and their lifecycle.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use canopy_common::resources::Resource;
use canopy_common::security::UserGroup;

use crate::allocation::AllocationInfo;
use crate::errors::CacheError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplicationState {
    New,
    Accepted,
    Rejected,
    Running,
    Completed,
    Killed,
    Failed,
}

impl std::fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplicationState::New => "New",
            ApplicationState::Accepted => "Accepted",
            ApplicationState::Rejected => "Rejected",
            ApplicationState::Running => "Running",
            ApplicationState::Completed => "Completed",
            ApplicationState::Killed => "Killed",
            ApplicationState::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle events driving the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplicationEvent {
    Accept,
    Reject,
    Run,
    Complete,
    Kill,
    Fail,
}

impl std::fmt::Display for ApplicationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplicationEvent::Accept => "Accept",
            ApplicationEvent::Reject => "Reject",
            ApplicationEvent::Run => "Run",
            ApplicationEvent::Complete => "Complete",
            ApplicationEvent::Kill => "Kill",
            ApplicationEvent::Fail => "Fail",
        };
        write!(f, "{s}")
    }
}

pub struct ApplicationInfo {
    application_id: String,
    partition: String,
    user: UserGroup,
    tags: HashMap<String, String>,
    submission_time: DateTime<Utc>,
    inner: RwLock<AppInner>,
}

struct AppInner {
    queue_name: String,
    state: ApplicationState,
    allocated: Resource,
    allocations: HashMap<Uuid, AllocationInfo>,
}

impl ApplicationInfo {
    pub fn new(
        application_id: &str,
        partition: &str,
        queue_name: &str,
        user: UserGroup,
        tags: HashMap<String, String>,
    ) -> Self {
        Self {
            application_id: application_id.to_string(),
            partition: partition.to_string(),
            user,
            tags,
            submission_time: Utc::now(),
            inner: RwLock::new(AppInner {
                queue_name: queue_name.to_string(),
                state: ApplicationState::New,
                allocated: Resource::new(),
                allocations: HashMap::new(),
            }),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn user(&self) -> &UserGroup {
        &self.user
    }

    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags.get(key).cloned()
    }

    pub fn submission_time(&self) -> DateTime<Utc> {
        self.submission_time
    }

    /// The leaf queue this application lives in. Set once placement has
    /// decided and never changed afterwards.
    pub fn queue_name(&self) -> String {
        self.inner.read().queue_name.clone()
    }

    pub fn set_queue(&self, queue_name: &str) {
        self.inner.write().queue_name = queue_name.to_string();
    }

    pub fn state(&self) -> ApplicationState {
        self.inner.read().state
    }

    pub fn is_schedulable(&self) -> bool {
        matches!(
            self.state(),
            ApplicationState::Accepted | ApplicationState::Running
        )
    }

    /// Drive the lifecycle. Invalid transitions leave the state untouched.
    pub fn handle_event(&self, event: ApplicationEvent) -> Result<(), CacheError> {
        use ApplicationEvent as E;
        use ApplicationState as S;
        let mut inner = self.inner.write();
        let next = match (inner.state, event) {
            (S::New, E::Accept) => S::Accepted,
            (S::New, E::Reject) => S::Rejected,
            (S::Accepted, E::Run) => S::Running,
            (S::Running, E::Run) => S::Running,
            (S::Accepted | S::Running, E::Complete) => S::Completed,
            (S::New | S::Accepted | S::Running, E::Kill) => S::Killed,
            (S::Accepted | S::Running, E::Fail) => S::Failed,
            (from, event) => {
                return Err(CacheError::InvalidApplicationState {
                    from: from.to_string(),
                    event: event.to_string(),
                })
            }
        };
        if inner.state != next {
            debug!(application = %self.application_id, from = %inner.state, to = %next,
                "application state changed");
        }
        inner.state = next;
        Ok(())
    }

    pub fn allocated_resource(&self) -> Resource {
        self.inner.read().allocated.clone()
    }

    pub fn allocations(&self) -> Vec<AllocationInfo> {
        self.inner.read().allocations.values().cloned().collect()
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.read().allocations.len()
    }

    /// Number of placed allocations for one allocation key, used to
    /// re-derive pending repeats when an ask is updated.
    pub fn allocations_for_key(&self, allocation_key: &str) -> i32 {
        self.inner
            .read()
            .allocations
            .values()
            .filter(|a| a.allocation_key == allocation_key)
            .count() as i32
    }

    /// Index a placed allocation. The first allocation moves an accepted
    /// application to running.
    pub fn add_allocation(&self, allocation: AllocationInfo) {
        {
            let mut inner = self.inner.write();
            inner.allocated.add_to(&allocation.resource);
            inner.allocations.insert(allocation.uuid, allocation);
        }
        if self.state() == ApplicationState::Accepted {
            // infallible from Accepted
            let _ = self.handle_event(ApplicationEvent::Run);
        }
    }

    pub fn remove_allocation(&self, uuid: &Uuid) -> Option<AllocationInfo> {
        let mut inner = self.inner.write();
        let removed = inner.allocations.remove(uuid)?;
        inner.allocated = inner.allocated.sub_eliminate_negative(&removed.resource);
        Some(removed)
    }

    pub fn remove_all_allocations(&self) -> Vec<AllocationInfo> {
        let mut inner = self.inner.write();
        inner.allocated = Resource::new();
        inner.allocations.drain().map(|(_, a)| a).collect()
    }
}

impl std::fmt::Debug for ApplicationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationInfo")
            .field("application_id", &self.application_id)
            .field("partition", &self.partition)
            .field("queue", &self.queue_name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> ApplicationInfo {
        ApplicationInfo::new(
            "app-1",
            "default@rm-1",
            "root.a",
            UserGroup::new("alice", vec!["devs".to_string()]),
            HashMap::new(),
        )
    }

    fn alloc(uuid: Uuid, memory: i64) -> AllocationInfo {
        AllocationInfo {
            uuid,
            allocation_key: "ask-1".to_string(),
            application_id: "app-1".to_string(),
            node_id: "n1".to_string(),
            queue_name: "root.a".to_string(),
            partition_name: "default@rm-1".to_string(),
            resource: Resource::from_pairs([("memory".to_string(), memory)]),
            priority: 0,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let app = app();
        assert_eq!(app.state(), ApplicationState::New);
        app.handle_event(ApplicationEvent::Accept).unwrap();
        app.handle_event(ApplicationEvent::Run).unwrap();
        app.handle_event(ApplicationEvent::Complete).unwrap();
        assert_eq!(app.state(), ApplicationState::Completed);
    }

    #[test]
    fn test_invalid_transition_keeps_state() {
        let app = app();
        app.handle_event(ApplicationEvent::Accept).unwrap();
        app.handle_event(ApplicationEvent::Run).unwrap();
        assert!(app.handle_event(ApplicationEvent::Accept).is_err());
        assert_eq!(app.state(), ApplicationState::Running);

        app.handle_event(ApplicationEvent::Kill).unwrap();
        assert!(app.handle_event(ApplicationEvent::Run).is_err());
        assert_eq!(app.state(), ApplicationState::Killed);
    }

    #[test]
    fn test_allocation_bookkeeping() {
        let app = app();
        app.handle_event(ApplicationEvent::Accept).unwrap();

        let id1 = Uuid::new_v4();
        app.add_allocation(alloc(id1, 100));
        // first allocation starts the application
        assert_eq!(app.state(), ApplicationState::Running);
        let id2 = Uuid::new_v4();
        app.add_allocation(alloc(id2, 200));

        assert_eq!(
            app.allocated_resource(),
            Resource::from_pairs([("memory".to_string(), 300)])
        );
        assert_eq!(app.allocations_for_key("ask-1"), 2);

        let removed = app.remove_allocation(&id1).unwrap();
        assert_eq!(removed.uuid, id1);
        assert_eq!(
            app.allocated_resource(),
            Resource::from_pairs([("memory".to_string(), 200)])
        );

        let rest = app.remove_all_allocations();
        assert_eq!(rest.len(), 1);
        assert!(app.allocated_resource().is_zero());
    }
}
