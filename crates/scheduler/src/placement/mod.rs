//! The application placement pipeline.
//!
//! An ordered chain of rules maps an incoming application to a queue path.
//! Rules run in declared order; the first rule producing a non-empty path
//! wins. A rule returning no path is skipped silently, a rule returning an
//! error aborts placement and rejects the application.

mod filter;
mod fixed;
mod group;
mod provided;
mod tag;
mod user;

pub use filter::Filter;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use canopy_cache::{ApplicationInfo, PartitionInfo};
use canopy_common::config::PlacementRuleConfig;
use canopy_common::{DOT, ROOT_QUEUE};

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("unknown placement rule '{0}'")]
    UnknownRule(String),
    #[error("placement rule '{rule}' is misconfigured: {reason}")]
    InvalidRule { rule: &'static str, reason: String },
    #[error("parent rule returned leaf queue '{0}'")]
    ParentIsLeaf(String),
    #[error("no placement rule matched application '{0}'")]
    NoRuleMatched(String),
}

/// One rule of the chain. Rules are synchronous: they only look at the
/// application and the partition's queue tree.
pub trait PlacementRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a queue produced by this rule may be created dynamically.
    fn create(&self) -> bool;

    /// Compute the queue path for the application. `Ok(None)` means the
    /// rule does not apply and the next rule runs.
    fn place(
        &self,
        app: &ApplicationInfo,
        partition: &PartitionInfo,
    ) -> Result<Option<String>, PlacementError>;
}

/// Shared behavior of all rules: the filter gate, the optional parent rule
/// and the create-or-skip resolution of the final path.
pub(crate) struct RuleBase {
    pub create: bool,
    pub filter: Filter,
    pub parent: Option<Box<dyn PlacementRule>>,
}

impl RuleBase {
    fn from_config(conf: &PlacementRuleConfig) -> Result<Self, PlacementError> {
        let parent = match &conf.parent {
            Some(parent_conf) => Some(new_rule(parent_conf)?),
            None => None,
        };
        Ok(Self {
            create: conf.create,
            filter: Filter::from_config(&conf.filter)?,
            parent,
        })
    }

    /// Turn a candidate leaf name into a final queue path. A qualified name
    /// is used as given; an unqualified one is placed below the parent
    /// rule's result (or the root). Missing queues skip the rule unless it
    /// may create.
    fn qualify(
        &self,
        name: &str,
        app: &ApplicationInfo,
        partition: &PartitionInfo,
    ) -> Result<Option<String>, PlacementError> {
        let queue_name = if is_qualified(name) {
            name.to_string()
        } else {
            let parent_name = match &self.parent {
                Some(rule) => match rule.place(app, partition)? {
                    None => return Ok(None),
                    Some(parent_name) => {
                        let parent_name = if is_qualified(&parent_name) {
                            parent_name
                        } else {
                            format!("{ROOT_QUEUE}{DOT}{parent_name}")
                        };
                        if let Some(queue) = partition.get_queue(&parent_name) {
                            if queue.is_leaf() {
                                return Err(PlacementError::ParentIsLeaf(parent_name));
                            }
                        }
                        parent_name
                    }
                },
                None => ROOT_QUEUE.to_string(),
            };
            format!("{parent_name}{DOT}{name}")
        };
        if !self.create && partition.get_queue(&queue_name).is_none() {
            return Ok(None);
        }
        Ok(Some(queue_name))
    }
}

pub(crate) fn is_qualified(name: &str) -> bool {
    name == ROOT_QUEUE || name.starts_with(&format!("{ROOT_QUEUE}{DOT}"))
}

/// Queue names come from free-form sources (user names, tags); lower-case
/// them and replace the path separator so they form a single queue level.
pub(crate) fn normalise(name: &str) -> String {
    name.to_lowercase().replace(DOT, "_")
}

/// Instantiate a rule from its configuration. Rule names are matched case
/// insensitively.
pub fn new_rule(conf: &PlacementRuleConfig) -> Result<Box<dyn PlacementRule>, PlacementError> {
    let base = RuleBase::from_config(conf)?;
    let rule: Box<dyn PlacementRule> = match conf.name.to_lowercase().as_str() {
        "provided" => Box::new(provided::ProvidedRule::new(base)),
        "fixed" => Box::new(fixed::FixedRule::new(base, conf.value.as_deref())?),
        "user" => Box::new(user::UserRule::new(base)),
        "primarygroup" | "primarygroupname" => Box::new(group::PrimaryGroupRule::new(base)),
        "secondarygroup" | "secondarygroupname" => Box::new(group::SecondaryGroupRule::new(base)),
        "tag" => Box::new(tag::TagRule::new(base, conf.value.as_deref())?),
        _ => return Err(PlacementError::UnknownRule(conf.name.clone())),
    };
    Ok(rule)
}

/// The configured rule chain of one partition.
pub struct PlacementManager {
    rules: Vec<Box<dyn PlacementRule>>,
}

impl PlacementManager {
    /// Build the chain. An empty configuration falls back to honoring the
    /// queue submitted with the application, without creating queues.
    pub fn from_config(rules: &[PlacementRuleConfig]) -> Result<Self, PlacementError> {
        let rules = if rules.is_empty() {
            vec![new_rule(&PlacementRuleConfig {
                name: "provided".to_string(),
                ..PlacementRuleConfig::default()
            })?]
        } else {
            rules.iter().map(new_rule).collect::<Result<_, _>>()?
        };
        Ok(Self { rules })
    }

    /// Run the chain for an application. Returns the queue path and
    /// whether the matching rule allows creating it.
    pub fn place(
        &self,
        app: &Arc<ApplicationInfo>,
        partition: &PartitionInfo,
    ) -> Result<(String, bool), PlacementError> {
        for rule in &self.rules {
            match rule.place(app, partition)? {
                Some(queue_name) => {
                    info!(application = %app.application_id(), rule = rule.name(),
                        queue = %queue_name, "application placed");
                    return Ok((queue_name, rule.create()));
                }
                None => {
                    debug!(application = %app.application_id(), rule = rule.name(),
                        "rule skipped");
                }
            }
        }
        Err(PlacementError::NoRuleMatched(
            app.application_id().to_string(),
        ))
    }
}
