//! Typed messages exchanged between the scheduler core and the resource
//! manager facing shim.
//!
//! Inbound events carry node, application, ask and release deltas into the
//! core; outbound events carry allocations, rejections and release
//! responses back to the shim. Both directions travel over a single channel
//! per direction so ordering within a partition is the commit order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resources::Resource;
use crate::security::UserGroup;

/// How an allocation was terminated, reported with every release response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationType {
    StoppedByRM,
    Timeout,
    PreemptedByScheduler,
}

/// Operator of a single node-attribute match expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeOperator {
    In,
    NotIn,
    Exists,
}

/// One node-attribute requirement attached to an ask.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeExpression {
    pub key: String,
    pub operator: AttributeOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl AttributeExpression {
    /// Evaluate the expression against a node attribute map.
    pub fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        let value = attributes.get(&self.key);
        match self.operator {
            AttributeOperator::Exists => value.is_some(),
            AttributeOperator::In => value.is_some_and(|v| self.values.iter().any(|c| c == v)),
            AttributeOperator::NotIn => !value.is_some_and(|v| self.values.iter().any(|c| c == v)),
        }
    }
}

/// Placement constraint carried by an ask: every expression must hold on
/// the selected node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConstraint {
    #[serde(default)]
    pub expressions: Vec<AttributeExpression>,
}

impl PlacementConstraint {
    pub fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        self.expressions.iter().all(|e| e.matches(attributes))
    }
}

/// A repeated allocation request: up to `max_allocations` containers of the
/// given resource shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationAsk {
    pub allocation_key: String,
    pub application_id: String,
    pub partition_name: String,
    #[serde(default)]
    pub queue_name: String,
    pub resource: Resource,
    #[serde(default)]
    pub priority: i32,
    pub max_allocations: i32,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub placement_constraint: Option<PlacementConstraint>,
}

/// A concrete binding of a resource slice on a node to an application.
/// The scheduler assigns the uuid; recovered allocations arrive with the
/// uuid the scheduler assigned before the RM restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub uuid: Uuid,
    pub allocation_key: String,
    pub application_id: String,
    pub node_id: String,
    pub queue_name: String,
    pub partition_name: String,
    pub resource: Resource,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// A node joining the partition, optionally reporting allocations that
/// already run on it (RM re-registration).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    pub node_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub capacity: Resource,
    #[serde(default)]
    pub existing_allocations: Vec<Allocation>,
}

/// An update to an already registered node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdatedNode {
    pub node_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub capacity: Option<Resource>,
}

/// A new application submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddApplication {
    pub application_id: String,
    /// Queue path the submitter asked for; may be empty or unqualified,
    /// placement rules decide the final queue.
    #[serde(default)]
    pub queue_name: String,
    pub partition_name: String,
    pub user: UserGroup,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveApplication {
    pub application_id: String,
    pub partition_name: String,
}

/// RM initiated release of a placed allocation. When `uuid` is absent every
/// allocation of the application is released.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRelease {
    pub partition_name: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub message: String,
}

/// RM initiated withdrawal of a pending ask.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationAskRelease {
    pub partition_name: String,
    pub application_id: String,
    pub allocation_key: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationReleases {
    #[serde(default)]
    pub allocations: Vec<AllocationRelease>,
    #[serde(default)]
    pub asks: Vec<AllocationAskRelease>,
}

/// Batched delta from one RM.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub rm_id: String,
    #[serde(default)]
    pub asks: Vec<AllocationAsk>,
    #[serde(default)]
    pub releases: AllocationReleases,
    #[serde(default)]
    pub new_nodes: Vec<NewNode>,
    #[serde(default)]
    pub updated_nodes: Vec<UpdatedNode>,
    #[serde(default)]
    pub new_applications: Vec<AddApplication>,
    #[serde(default)]
    pub remove_applications: Vec<RemoveApplication>,
}

/// Events flowing from the RM shim into the core.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    RegisterResourceManager {
        rm_id: String,
        policy_group: String,
        version: String,
    },
    Update(UpdateRequest),
    ConfigUpdate {
        rm_id: String,
        config: crate::config::SchedulerConfig,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedApplication {
    pub application_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedApplication {
    pub application_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedAllocationAsk {
    pub allocation_key: String,
    pub application_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedAllocation {
    pub uuid: Uuid,
    pub application_id: String,
    pub partition_name: String,
    pub termination_type: TerminationType,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedNode {
    pub node_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedNode {
    pub node_id: String,
    pub reason: String,
}

/// Events flowing from the core back to the RM shim.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundEvent {
    NewAllocations {
        rm_id: String,
        allocations: Vec<Allocation>,
    },
    ApplicationUpdate {
        rm_id: String,
        accepted: Vec<AcceptedApplication>,
        rejected: Vec<RejectedApplication>,
    },
    RejectedAllocationAsks {
        rm_id: String,
        rejected: Vec<RejectedAllocationAsk>,
    },
    ReleaseAllocations {
        rm_id: String,
        releases: Vec<ReleasedAllocation>,
    },
    NodeUpdate {
        rm_id: String,
        accepted: Vec<AcceptedNode>,
        rejected: Vec<RejectedNode>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_expressions() {
        let mut attrs = HashMap::new();
        attrs.insert("rack".to_string(), "r1".to_string());

        let in_expr = AttributeExpression {
            key: "rack".to_string(),
            operator: AttributeOperator::In,
            values: vec!["r1".to_string(), "r2".to_string()],
        };
        assert!(in_expr.matches(&attrs));

        let not_in = AttributeExpression {
            key: "rack".to_string(),
            operator: AttributeOperator::NotIn,
            values: vec!["r1".to_string()],
        };
        assert!(!not_in.matches(&attrs));

        let exists = AttributeExpression {
            key: "zone".to_string(),
            operator: AttributeOperator::Exists,
            values: vec![],
        };
        assert!(!exists.matches(&attrs));
        // NotIn holds when the attribute is absent
        let not_in_absent = AttributeExpression {
            key: "zone".to_string(),
            operator: AttributeOperator::NotIn,
            values: vec!["z1".to_string()],
        };
        assert!(not_in_absent.matches(&attrs));
    }

    #[test]
    fn test_placement_constraint_is_conjunction() {
        let mut attrs = HashMap::new();
        attrs.insert("rack".to_string(), "r1".to_string());
        attrs.insert("zone".to_string(), "z1".to_string());

        let constraint = PlacementConstraint {
            expressions: vec![
                AttributeExpression {
                    key: "rack".to_string(),
                    operator: AttributeOperator::In,
                    values: vec!["r1".to_string()],
                },
                AttributeExpression {
                    key: "zone".to_string(),
                    operator: AttributeOperator::In,
                    values: vec!["z2".to_string()],
                },
            ],
        };
        assert!(!constraint.matches(&attrs));
    }
}
