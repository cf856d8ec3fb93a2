//! Configuration snapshot model.
//!
//! A snapshot is a YAML document with a top-level `partitions` list; each
//! partition carries a nested queue tree, placement rules, user quota
//! entries and a preemption block. [`load_config`] parses and validates in
//! one step: an invalid snapshot is rejected as a whole and never produces
//! partial state.

mod validation;

pub use validation::validate;

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::Resource;
use crate::security::AclError;

/// Queue property key selecting how a leaf sorts its applications.
pub const APPLICATION_SORT_POLICY: &str = "application.sort.policy";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("duplicate partition name '{0}'")]
    DuplicatePartition(String),
    #[error("partition '{0}' does not define any queue")]
    NoQueues(String),
    #[error("invalid queue name '{name}' in '{path}': {reason}")]
    InvalidQueueName {
        path: String,
        name: String,
        reason: String,
    },
    #[error("duplicate queue '{0}'")]
    DuplicateQueue(String),
    #[error("root queue '{0}' must not configure a max resource")]
    RootMaxForbidden(String),
    #[error("negative quantity for resource '{key}' on queue '{path}'")]
    NegativeResource { path: String, key: String },
    #[error("invalid ACL on queue '{path}': {source}")]
    InvalidAcl { path: String, source: AclError },
    #[error("invalid placement filter type '{0}', expected allow or deny")]
    InvalidFilterType(String),
    #[error("invalid placement filter {kind} entry '{entry}': {reason}")]
    InvalidFilterEntry {
        kind: &'static str,
        entry: String,
        reason: String,
    },
    #[error("invalid user limit for '{name}': {reason}")]
    InvalidUserLimit { name: String, reason: String },
}

/// Top level configuration snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub partitions: Vec<PartitionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default, rename = "placementrules")]
    pub placement_rules: Vec<PlacementRuleConfig>,
    #[serde(default)]
    pub users: Vec<UserLimitConfig>,
    #[serde(default)]
    pub preemption: PreemptionConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Marks a queue as a parent even when it has no configured children;
    /// children may then be created dynamically below it.
    #[serde(default)]
    pub parent: bool,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default, rename = "adminacl", skip_serializing_if = "Option::is_none")]
    pub admin_acl: Option<String>,
    #[serde(default, rename = "submitacl", skip_serializing_if = "Option::is_none")]
    pub submit_acl: Option<String>,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(
        default,
        rename = "maxapplications",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_applications: Option<u64>,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub guaranteed: BTreeMap<String, i64>,
    #[serde(default)]
    pub max: BTreeMap<String, i64>,
}

impl ResourcesConfig {
    pub fn guaranteed_resource(&self) -> Resource {
        self.guaranteed
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn max_resource(&self) -> Resource {
        self.max.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementRuleConfig {
    pub name: String,
    #[serde(default)]
    pub create: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<PlacementRuleConfig>>,
    #[serde(default)]
    pub filter: FilterConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub filter_type: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserLimitConfig {
    pub name: String,
    #[serde(
        default,
        rename = "maxapplications",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_applications: Option<u64>,
    #[serde(default, rename = "maxresources")]
    pub max_resources: BTreeMap<String, i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Parse a YAML snapshot and validate it. On success the returned config has
/// every partition's queue list reduced to a single root queue (an implicit
/// root is inserted when the snapshot declares top-level queues directly).
pub fn load_config(yaml: &str) -> Result<SchedulerConfig, ConfigError> {
    let mut config: SchedulerConfig = serde_yaml::from_str(yaml)?;
    validate(&mut config)?;
    Ok(config)
}
