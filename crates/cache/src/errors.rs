//! Error type shared by all cache operations.

use thiserror::Error;

use canopy_common::config::ConfigError;
use canopy_common::security::AclError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("partition '{0}' is not known")]
    PartitionNotFound(String),
    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),
    #[error("queue '{0}' is not a leaf queue")]
    QueueNotLeaf(String),
    #[error("queue '{0}' is a leaf queue and cannot have children")]
    QueueNotParent(String),
    #[error("queue '{0}' does not accept new applications in state {1}")]
    QueueNotRunning(String, String),
    #[error("user '{user}' is denied access to queue '{queue}' by ACL")]
    AclDeny { user: String, queue: String },
    #[error("allocation would exceed the max resource of queue '{0}'")]
    QueueMaxExceeded(String),
    #[error("application '{0}' already exists")]
    ApplicationExists(String),
    #[error("application '{0}' is not known")]
    ApplicationNotFound(String),
    #[error("invalid application state transition from {from} on {event}")]
    InvalidApplicationState { from: String, event: String },
    #[error("node '{0}' already exists")]
    NodeExists(String),
    #[error("node '{0}' is not known")]
    NodeNotFound(String),
    #[error("allocation does not fit on node '{0}'")]
    NodeNoFit(String),
    #[error("user '{user}' exceeds the maximum of {limit} running applications")]
    UserLimitExceeded { user: String, limit: u64 },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid ACL: {0}")]
    Acl(#[from] AclError),
}
