//! Scheduler level errors.

use thiserror::Error;

use canopy_cache::CacheError;

use crate::placement::PlacementError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error("partition '{0}' is not known")]
    PartitionNotFound(String),
    #[error("application '{0}' is not known")]
    ApplicationNotFound(String),
    #[error("invalid ask '{allocation_key}': {reason}")]
    InvalidAsk {
        allocation_key: String,
        reason: String,
    },
}
