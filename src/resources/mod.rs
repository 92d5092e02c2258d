// src/resources/mod.rs

//! Shared, capacity-bounded resources.
//!
//! - [`model`] defines resources, requirements, allocations and usage views.
//! - [`table`] is the pure allocation table that enforces capacity and
//!   access-mode rules.
//! - [`manager`] wraps the table in a lock and adds the expiry sweep and
//!   persistence.
//! - [`bootstrap`] derives default resources from the host.

pub mod bootstrap;
pub mod manager;
pub mod model;
pub mod table;

pub use bootstrap::{HostCapacity, default_resources, default_resources_for};
pub use manager::ResourceManager;
pub use model::{
    AllocationId, AllocationSet, Amounts, Requirements, Resource, ResourceAllocation, ResourceId,
    ResourceLimits, ResourceRequirement, ResourceSnapshot, ResourceUsage, SystemResourceUsage,
    TypeUsage, UserId,
};
pub use table::ResourceTable;
