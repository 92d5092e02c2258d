// src/resources/model.rs

//! Resource, allocation and usage types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccessMode, ResourceStatus, ResourceType};

pub type ResourceId = String;
pub type UserId = String;
pub type AllocationId = String;

/// Amounts keyed by sub-dimension (e.g. `{"cores": 2.0}`).
pub type Amounts = BTreeMap<String, f64>;

/// Slack used when comparing float amounts against remaining capacity.
pub(crate) const CAPACITY_EPSILON: f64 = 1e-9;

/// Optional per-resource limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of distinct users holding the resource at once.
    pub max_concurrent_users: Option<usize>,
    /// Lease applied to allocations made without an explicit timeout.
    pub default_lease_secs: Option<f64>,
}

/// A named, typed, capacity-bounded resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub resource_type: ResourceType,
    pub capacity: Amounts,
    pub allocated: Amounts,
    pub status: ResourceStatus,
    pub limits: ResourceLimits,
    pub current_users: BTreeSet<UserId>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        resource_type: ResourceType,
        capacity: Amounts,
    ) -> Self {
        let allocated = capacity.keys().map(|k| (k.clone(), 0.0)).collect();
        Self {
            id: id.into(),
            name: name.into(),
            resource_type,
            capacity,
            allocated,
            status: ResourceStatus::Available,
            limits: ResourceLimits::default(),
            current_users: BTreeSet::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_users(mut self, max: usize) -> Self {
        self.limits.max_concurrent_users = Some(max);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Remaining capacity for a sub-dimension (0 for unknown keys).
    pub fn available(&self, key: &str) -> f64 {
        let cap = self.capacity.get(key).copied().unwrap_or(0.0);
        let used = self.allocated.get(key).copied().unwrap_or(0.0);
        (cap - used).max(0.0)
    }

    /// Utilization percentage per sub-dimension.
    pub fn dimension_utilization(&self) -> BTreeMap<String, f64> {
        self.capacity
            .iter()
            .map(|(key, cap)| {
                let used = self.allocated.get(key).copied().unwrap_or(0.0);
                let pct = if *cap > 0.0 { used / cap * 100.0 } else { 0.0 };
                (key.clone(), pct)
            })
            .collect()
    }

    /// Mean utilization percentage across sub-dimensions.
    ///
    /// Capacity-less resources (pure locks) count as 100% while held.
    pub fn utilization(&self) -> f64 {
        let dims = self.dimension_utilization();
        if dims.is_empty() {
            return if self.current_users.is_empty() { 0.0 } else { 100.0 };
        }
        dims.values().sum::<f64>() / dims.len() as f64
    }

    pub fn matches(&self, selector: &str) -> bool {
        selector.is_empty() || selector == "*" || self.id == selector || self.name == selector
    }
}

/// What a requester needs from one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub resource_type: ResourceType,
    #[serde(default)]
    pub amounts: Amounts,
    #[serde(default)]
    pub mode: AccessMode,
    /// Pin to a resource id or name. `None`, `""` and `"*"` mean any resource
    /// of `resource_type`.
    #[serde(default)]
    pub resource: Option<String>,
}

impl ResourceRequirement {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            amounts: Amounts::new(),
            mode: AccessMode::Read,
            resource: None,
        }
    }

    pub fn amount(mut self, key: impl Into<String>, value: f64) -> Self {
        self.amounts.insert(key.into(), value);
        self
    }

    pub fn mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn pinned(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Requirement key (caller chosen, e.g. `"cpu"`) to requirement.
pub type Requirements = BTreeMap<String, ResourceRequirement>;

/// Receipt binding a requester to a claim on one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceAllocation {
    pub id: AllocationId,
    pub resource_id: ResourceId,
    pub user_id: UserId,
    pub requirement_key: String,
    pub mode: AccessMode,
    pub allocated: Amounts,
    pub allocated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResourceAllocation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Result of a successful `allocate_resources` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationSet {
    pub user_id: UserId,
    /// Requirement key to the allocation that satisfied it.
    pub allocations: BTreeMap<String, ResourceAllocation>,
}

impl AllocationSet {
    /// Requirement key to granted resource id.
    pub fn resource_ids(&self) -> BTreeMap<String, ResourceId> {
        self.allocations
            .iter()
            .map(|(key, alloc)| (key.clone(), alloc.resource_id.clone()))
            .collect()
    }

    pub fn allocation_ids(&self) -> Vec<AllocationId> {
        self.allocations.values().map(|a| a.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

/// Point-in-time view of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub name: String,
    pub resource_type: ResourceType,
    pub status: ResourceStatus,
    pub capacity: Amounts,
    pub allocated: Amounts,
    pub utilization: BTreeMap<String, f64>,
    pub overall_utilization: f64,
    pub current_users: Vec<UserId>,
    pub active_allocations: usize,
}

/// Aggregate for one resource type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeUsage {
    pub count: usize,
    pub in_use: usize,
    pub average_utilization: f64,
}

/// System-wide usage aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemResourceUsage {
    pub total_resources: usize,
    pub active_allocations: usize,
    pub average_utilization: f64,
    pub by_type: BTreeMap<String, TypeUsage>,
}

/// Answer of `resource_usage`: one resource or the whole system.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ResourceUsage {
    Resource(ResourceSnapshot),
    System(SystemResourceUsage),
}
