//! Authoritative state for the canopy scheduler core.
//!
//! The cache holds what the resource managers have confirmed: the queue
//! hierarchy with its limits and allocated totals, the applications with
//! their placed allocations, and the nodes with their capacities. The
//! scheduling mirror in `canopy-scheduler` layers in-flight intent on top;
//! everything in this crate changes only when a delta is ingested or a
//! proposal is committed.

pub mod allocation;
pub mod application;
pub mod cluster;
pub mod errors;
pub mod node;
pub mod partition;
pub mod queue;

pub use allocation::AllocationInfo;
pub use application::{ApplicationEvent, ApplicationInfo, ApplicationState};
pub use cluster::ClusterInfo;
pub use errors::CacheError;
pub use node::NodeInfo;
pub use partition::PartitionInfo;
pub use queue::{QueueInfo, QueueState};
