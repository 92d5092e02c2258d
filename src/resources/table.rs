// src/resources/table.rs

//! Pure allocation table.
//!
//! `ResourceTable` owns resources and their active allocations and enforces
//! every capacity invariant. It has no locks, no IO and no clock of its own:
//! callers pass `now` in. [`ResourceManager`](super::ResourceManager) wraps it
//! in a mutex and adds persistence and the expiry sweep.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{OrchestratorError, Result};
use crate::resources::model::{
    AllocationId, AllocationSet, CAPACITY_EPSILON, Requirements, Resource, ResourceAllocation,
    ResourceId, ResourceRequirement, ResourceSnapshot, ResourceUsage, SystemResourceUsage,
    TypeUsage, UserId,
};
use crate::types::ResourceStatus;

#[derive(Debug, Default)]
pub struct ResourceTable {
    resources: BTreeMap<ResourceId, Resource>,
    allocations: HashMap<AllocationId, ResourceAllocation>,
    by_user: HashMap<UserId, BTreeSet<AllocationId>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a resource. Replacing one that has users fails.
    pub fn add_resource(&mut self, mut resource: Resource) -> Result<()> {
        if let Some(existing) = self.resources.get(&resource.id) {
            if !existing.current_users.is_empty() {
                return Err(OrchestratorError::ResourceBusy(resource.id));
            }
            warn!(resource = %resource.id, "replacing existing resource definition");
        }

        for key in resource.capacity.keys() {
            resource.allocated.entry(key.clone()).or_insert(0.0);
        }
        resource.current_users.clear();
        if resource.status == ResourceStatus::InUse {
            resource.status = ResourceStatus::Available;
        }

        self.resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    pub fn remove_resource(&mut self, id: &str) -> Result<Resource> {
        let resource = self
            .resources
            .get(id)
            .ok_or_else(|| OrchestratorError::UnknownResource(id.to_string()))?;
        if !resource.current_users.is_empty() {
            return Err(OrchestratorError::ResourceBusy(id.to_string()));
        }
        self.resources
            .remove(id)
            .ok_or_else(|| OrchestratorError::UnknownResource(id.to_string()))
    }

    /// Set an operator status. `Available`/`InUse` are normalised against
    /// the actual user set.
    pub fn set_status(&mut self, id: &str, status: ResourceStatus) -> Result<()> {
        let resource = self
            .resources
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::UnknownResource(id.to_string()))?;
        resource.status = status;
        Self::refresh_status(resource);
        Ok(())
    }

    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn allocations_for(&self, user_id: &str) -> Vec<ResourceAllocation> {
        self.by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.allocations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `user_id` may be granted `req` on `resource` right now.
    pub fn can_allocate(&self, resource: &Resource, user_id: &str, req: &ResourceRequirement) -> bool {
        if resource.resource_type != req.resource_type || !resource.status.accepts_allocations() {
            return false;
        }

        let already_holder = resource.current_users.contains(user_id);
        if let Some(max) = resource.limits.max_concurrent_users {
            if !already_holder && resource.current_users.len() >= max {
                return false;
            }
        }

        let conflicting_mode = self
            .allocations
            .values()
            .filter(|a| a.resource_id == resource.id && a.user_id != user_id)
            .any(|a| !req.mode.compatible_with(a.mode));
        if conflicting_mode {
            return false;
        }

        req.amounts.iter().all(|(key, amount)| {
            amount.is_finite()
                && *amount >= 0.0
                && resource.capacity.contains_key(key)
                && *amount <= resource.available(key) + CAPACITY_EPSILON
        })
    }

    /// All-or-nothing allocation of every requirement for `user_id`.
    ///
    /// Each requirement goes to the least-utilized eligible resource. If any
    /// requirement cannot be met, the allocations already made in this call
    /// are rolled back and `None` is returned.
    pub fn allocate(
        &mut self,
        user_id: &str,
        requirements: &Requirements,
        lease: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<AllocationSet> {
        let mut granted: BTreeMap<String, ResourceAllocation> = BTreeMap::new();

        for (key, req) in requirements {
            let candidate = self.pick_candidate(user_id, req);

            let Some(resource_id) = candidate else {
                debug!(
                    user = %user_id,
                    requirement = %key,
                    resource_type = %req.resource_type,
                    "no resource can satisfy requirement; rolling back"
                );
                for alloc in granted.values() {
                    self.release_one(&alloc.id);
                }
                return None;
            };

            let alloc = self.apply(user_id, key, req, &resource_id, lease, now);
            granted.insert(key.clone(), alloc);
        }

        Some(AllocationSet {
            user_id: user_id.to_string(),
            allocations: granted,
        })
    }

    /// Release the given allocations of `user_id`, or all of them.
    ///
    /// Unknown ids and ids owned by another user are ignored.
    pub fn deallocate(
        &mut self,
        user_id: &str,
        allocation_ids: Option<&[AllocationId]>,
    ) -> Vec<ResourceAllocation> {
        let targets: Vec<AllocationId> = match allocation_ids {
            Some(ids) => ids
                .iter()
                .filter(|id| {
                    self.allocations
                        .get(id.as_str())
                        .is_some_and(|a| a.user_id == user_id)
                })
                .cloned()
                .collect(),
            None => self
                .by_user
                .get(user_id)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default(),
        };

        targets
            .iter()
            .filter_map(|id| self.release_one(id))
            .collect()
    }

    /// Force-release every allocation whose lease ran out.
    pub fn release_expired(&mut self, now: DateTime<Utc>) -> Vec<ResourceAllocation> {
        let expired: Vec<AllocationId> = self
            .allocations
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| a.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.release_one(id))
            .collect()
    }

    pub fn snapshot(&self, id: &str) -> Result<ResourceSnapshot> {
        let resource = self
            .resources
            .get(id)
            .ok_or_else(|| OrchestratorError::UnknownResource(id.to_string()))?;
        Ok(self.snapshot_of(resource))
    }

    pub fn usage(&self, resource_id: Option<&str>) -> Result<ResourceUsage> {
        match resource_id {
            Some(id) => Ok(ResourceUsage::Resource(self.snapshot(id)?)),
            None => Ok(ResourceUsage::System(self.system_usage())),
        }
    }

    pub fn system_usage(&self) -> SystemResourceUsage {
        let mut by_type: BTreeMap<String, TypeUsage> = BTreeMap::new();
        let mut total_util = 0.0;

        for resource in self.resources.values() {
            let util = resource.utilization();
            total_util += util;

            let entry = by_type
                .entry(resource.resource_type.as_str().to_string())
                .or_default();
            entry.count += 1;
            if !resource.current_users.is_empty() {
                entry.in_use += 1;
            }
            // Accumulate the sum here; divided below.
            entry.average_utilization += util;
        }

        for usage in by_type.values_mut() {
            if usage.count > 0 {
                usage.average_utilization /= usage.count as f64;
            }
        }

        let total = self.resources.len();
        SystemResourceUsage {
            total_resources: total,
            active_allocations: self.allocations.len(),
            average_utilization: if total > 0 { total_util / total as f64 } else { 0.0 },
            by_type,
        }
    }

    fn snapshot_of(&self, resource: &Resource) -> ResourceSnapshot {
        let active = self
            .allocations
            .values()
            .filter(|a| a.resource_id == resource.id)
            .count();
        ResourceSnapshot {
            id: resource.id.clone(),
            name: resource.name.clone(),
            resource_type: resource.resource_type,
            status: resource.status,
            capacity: resource.capacity.clone(),
            allocated: resource.allocated.clone(),
            utilization: resource.dimension_utilization(),
            overall_utilization: resource.utilization(),
            current_users: resource.current_users.iter().cloned().collect(),
            active_allocations: active,
        }
    }

    fn pick_candidate(&self, user_id: &str, req: &ResourceRequirement) -> Option<ResourceId> {
        let selector = req.resource.as_deref().unwrap_or("*");
        self.resources
            .values()
            .filter(|r| r.matches(selector) && self.can_allocate(r, user_id, req))
            .min_by(|a, b| {
                a.utilization()
                    .total_cmp(&b.utilization())
                    .then(a.current_users.len().cmp(&b.current_users.len()))
                    .then(a.id.cmp(&b.id))
            })
            .map(|r| r.id.clone())
    }

    fn apply(
        &mut self,
        user_id: &str,
        key: &str,
        req: &ResourceRequirement,
        resource_id: &str,
        lease: Option<Duration>,
        now: DateTime<Utc>,
    ) -> ResourceAllocation {
        let mut expires_at = None;

        if let Some(resource) = self.resources.get_mut(resource_id) {
            for (dim, amount) in &req.amounts {
                let used = resource.allocated.entry(dim.clone()).or_insert(0.0);
                let cap = resource.capacity.get(dim).copied().unwrap_or(0.0);
                *used = (*used + amount).min(cap);
            }
            resource.current_users.insert(user_id.to_string());
            Self::refresh_status(resource);

            let lease = lease.or_else(|| {
                resource
                    .limits
                    .default_lease_secs
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .map(Duration::from_secs_f64)
            });
            expires_at = lease
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d);
        }

        let alloc = ResourceAllocation {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            user_id: user_id.to_string(),
            requirement_key: key.to_string(),
            mode: req.mode,
            allocated: req.amounts.clone(),
            allocated_at: now,
            expires_at,
        };

        debug!(
            user = %user_id,
            resource = %resource_id,
            allocation = %alloc.id,
            mode = ?alloc.mode,
            "resource allocated"
        );

        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(alloc.id.clone());
        self.allocations.insert(alloc.id.clone(), alloc.clone());
        alloc
    }

    fn release_one(&mut self, allocation_id: &str) -> Option<ResourceAllocation> {
        let alloc = self.allocations.remove(allocation_id)?;

        if let Some(ids) = self.by_user.get_mut(&alloc.user_id) {
            ids.remove(allocation_id);
            if ids.is_empty() {
                self.by_user.remove(&alloc.user_id);
            }
        }

        let still_holds = self
            .allocations
            .values()
            .any(|a| a.resource_id == alloc.resource_id && a.user_id == alloc.user_id);

        if let Some(resource) = self.resources.get_mut(&alloc.resource_id) {
            for (dim, amount) in &alloc.allocated {
                if let Some(used) = resource.allocated.get_mut(dim) {
                    *used = (*used - amount).max(0.0);
                    if *used < CAPACITY_EPSILON {
                        *used = 0.0;
                    }
                }
            }
            if !still_holds {
                resource.current_users.remove(&alloc.user_id);
            }
            Self::refresh_status(resource);
        }

        debug!(
            user = %alloc.user_id,
            resource = %alloc.resource_id,
            allocation = %alloc.id,
            "resource released"
        );
        Some(alloc)
    }

    fn refresh_status(resource: &mut Resource) {
        if !resource.status.accepts_allocations() {
            return;
        }
        resource.status = if resource.current_users.is_empty() {
            ResourceStatus::Available
        } else {
            ResourceStatus::InUse
        };
    }
}
