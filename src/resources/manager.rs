// src/resources/manager.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::loader::{load_resource_file, save_resource_file};
use crate::config::model::{ResourceDefinition, ResourceFile};
use crate::errors::Result;
use crate::resources::bootstrap::default_resources;
use crate::resources::model::{
    AllocationId, AllocationSet, Requirements, Resource, ResourceAllocation, ResourceUsage,
    SystemResourceUsage,
};
use crate::resources::table::ResourceTable;
use crate::types::{ComponentHealth, ResourceStatus};

const DEFAULT_HIGH_UTILIZATION: f64 = 90.0;

/// Thread-safe arbiter of shared resources.
///
/// Every read and write of the allocation table happens under one mutex. The
/// critical sections are map lookups and arithmetic only; nothing awaits or
/// touches the filesystem while the lock is held.
#[derive(Debug)]
pub struct ResourceManager {
    table: Mutex<ResourceTable>,
    config_path: Option<PathBuf>,
    high_utilization_threshold: f64,
}

impl ResourceManager {
    /// Manager over an explicit resource set.
    pub fn new(resources: Vec<Resource>) -> Self {
        let mut table = ResourceTable::new();
        for resource in resources {
            let id = resource.id.clone();
            if let Err(e) = table.add_resource(resource) {
                warn!(resource = %id, error = %e, "skipping resource definition");
            }
        }

        Self {
            table: Mutex::new(table),
            config_path: None,
            high_utilization_threshold: DEFAULT_HIGH_UTILIZATION,
        }
    }

    /// Manager over host-derived default resources.
    pub fn with_defaults() -> Self {
        Self::new(default_resources())
    }

    /// Load resources from `path`, or bootstrap host defaults if the file
    /// does not exist. The path is remembered for [`save`](Self::save).
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut manager = if path.exists() {
            let file = load_resource_file(path)?;
            info!(
                path = %path.display(),
                count = file.resources.len(),
                "loaded resource definitions"
            );
            Self::new(file.resources.into_iter().map(Resource::from).collect())
        } else {
            info!(path = %path.display(), "no resource file; using host defaults");
            Self::with_defaults()
        };

        manager.config_path = Some(path.to_path_buf());
        Ok(manager)
    }

    pub fn with_utilization_threshold(mut self, percent: f64) -> Self {
        self.high_utilization_threshold = percent;
        self
    }

    /// Atomically allocate every requirement for `user_id`, or nothing.
    ///
    /// `timeout` sets the lease after which the sweep force-releases the
    /// allocations; without it each resource's default lease applies.
    /// Contention is not an error: `None` means "try again later".
    pub fn allocate_resources(
        &self,
        user_id: &str,
        requirements: &Requirements,
        timeout: Option<Duration>,
    ) -> Option<AllocationSet> {
        let granted = self
            .table
            .lock()
            .allocate(user_id, requirements, timeout, Utc::now());

        match &granted {
            Some(set) => debug!(
                user = %user_id,
                resources = ?set.resource_ids(),
                "allocation granted"
            ),
            None => debug!(
                user = %user_id,
                requirements = requirements.len(),
                "allocation refused"
            ),
        }
        granted
    }

    /// Release the named allocations of `user_id`, or all of them.
    ///
    /// Idempotent: unknown ids are ignored. Returns how many were released.
    pub fn deallocate_resources(
        &self,
        user_id: &str,
        allocation_ids: Option<&[AllocationId]>,
    ) -> usize {
        let released = self.table.lock().deallocate(user_id, allocation_ids);
        if !released.is_empty() {
            debug!(user = %user_id, count = released.len(), "allocations released");
        }
        released.len()
    }

    /// Force-release every allocation whose lease has run out.
    pub fn release_expired(&self) -> Vec<ResourceAllocation> {
        let released = self.table.lock().release_expired(Utc::now());
        for alloc in &released {
            warn!(
                user = %alloc.user_id,
                resource = %alloc.resource_id,
                allocation = %alloc.id,
                expires_at = ?alloc.expires_at,
                "allocation lease expired; force-released"
            );
        }
        released
    }

    /// Spawn the background expiry sweep. Stops when `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs_f64(), "resource sweep started");
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let released = manager.release_expired();
                        if !released.is_empty() {
                            info!(count = released.len(), "resource sweep released expired allocations");
                        }
                    }
                }
            }

            info!("resource sweep stopped");
        })
    }

    /// Usage of one resource, or the system-wide aggregate when `None`.
    pub fn resource_usage(&self, resource_id: Option<&str>) -> Result<ResourceUsage> {
        self.table.lock().usage(resource_id)
    }

    pub fn system_usage(&self) -> SystemResourceUsage {
        self.table.lock().system_usage()
    }

    pub fn add_resource(&self, resource: Resource) -> Result<()> {
        let id = resource.id.clone();
        self.table.lock().add_resource(resource)?;
        info!(resource = %id, "resource registered");
        Ok(())
    }

    pub fn remove_resource(&self, id: &str) -> Result<Resource> {
        let removed = self.table.lock().remove_resource(id)?;
        info!(resource = %id, "resource removed");
        Ok(removed)
    }

    pub fn set_resource_status(&self, id: &str, status: ResourceStatus) -> Result<()> {
        self.table.lock().set_status(id, status)?;
        info!(resource = %id, status = ?status, "resource status changed");
        Ok(())
    }

    pub fn resource(&self, id: &str) -> Option<Resource> {
        self.table.lock().resource(id).cloned()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.table.lock().resources().cloned().collect()
    }

    pub fn allocations_for(&self, user_id: &str) -> Vec<ResourceAllocation> {
        self.table.lock().allocations_for(user_id)
    }

    pub fn active_allocations(&self) -> usize {
        self.table.lock().allocation_count()
    }

    /// Persist resource definitions to `path`.
    pub fn save_config(&self, path: impl AsRef<Path>) -> Result<()> {
        // Snapshot under the lock, write outside it.
        let file = ResourceFile {
            resources: self
                .table
                .lock()
                .resources()
                .map(ResourceDefinition::from)
                .collect(),
        };
        save_resource_file(path, &file)
    }

    /// Persist to the file this manager was loaded from, if any.
    pub fn save(&self) -> Result<()> {
        match &self.config_path {
            Some(path) => self.save_config(path),
            None => {
                debug!("resource manager has no config path; nothing saved");
                Ok(())
            }
        }
    }

    /// Report resources above the utilization threshold or out of service.
    pub fn health(&self) -> ComponentHealth {
        let table = self.table.lock();
        let mut issues = Vec::new();

        for resource in table.resources() {
            let util = resource.utilization();
            if util > self.high_utilization_threshold {
                issues.push(format!(
                    "resource '{}' is {:.1}% utilized (threshold {:.1}%)",
                    resource.id, util, self.high_utilization_threshold
                ));
            }
            if matches!(
                resource.status,
                ResourceStatus::Maintenance | ResourceStatus::Unavailable
            ) {
                issues.push(format!(
                    "resource '{}' is {:?}",
                    resource.id, resource.status
                ));
            }
        }

        ComponentHealth::from_issues(issues)
    }
}
