//! The canopy scheduling engine.
//!
//! This crate layers scheduler intent on top of the authoritative caches in
//! `canopy-cache`:
//!
//! - a scheduling mirror ([`queue`], [`application`], [`node`]) tracking the
//!   proposing/allocating/pending deltas of in-flight work
//! - the [`placement`] pipeline mapping incoming applications to queues
//! - the allocation loop ([`allocator`]) doing per-partition depth-first,
//!   DRF-sorted traversal with bounded attempts per tick
//! - the DRF [`preemption`] engine for cross-queue reclamation
//! - the [`partition_manager`] cleaning up drained queues in the background
//! - the [`engine`] wiring the inbound and outbound event channels to all
//!   of the above

pub mod allocator;
pub mod application;
pub mod context;
pub mod engine;
pub mod errors;
pub mod node;
pub mod partition;
pub mod partition_manager;
pub mod placement;
pub mod preemption;
pub mod queue;
pub mod sorters;

pub use engine::{Scheduler, SchedulerOptions};
pub use errors::SchedulerError;
