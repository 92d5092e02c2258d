// src/resources/bootstrap.rs

//! Default resources derived from the host.

use sysinfo::{DiskExt, System, SystemExt};
use tracing::{debug, info};

use crate::resources::model::{Amounts, Resource};
use crate::types::ResourceType;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

const FALLBACK_CORES: f64 = 4.0;
const FALLBACK_MEMORY_GB: f64 = 8.0;
const FALLBACK_DISK_GB: f64 = 100.0;
const DEFAULT_NETWORK_MBPS: f64 = 1000.0;
const DEFAULT_API_REQUESTS: f64 = 1000.0;

/// Raw numbers used to build the default resource set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCapacity {
    pub cores: f64,
    pub memory_gb: f64,
    pub disk_gb: f64,
}

impl HostCapacity {
    /// Introspect the host; zero readings fall back to fixed defaults.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_disks_list();

        let cores = sys.cpus().len() as f64;
        let memory_gb = sys.total_memory() as f64 / GIB;
        let disk_gb = sys.disks().iter().map(|d| d.total_space()).sum::<u64>() as f64 / GIB;

        debug!(cores, memory_gb, disk_gb, "host capacity detected");
        Self::with_fallbacks(cores, memory_gb, disk_gb)
    }

    pub fn with_fallbacks(cores: f64, memory_gb: f64, disk_gb: f64) -> Self {
        fn or_default(value: f64, fallback: f64) -> f64 {
            if value.is_finite() && value > 0.0 {
                value
            } else {
                fallback
            }
        }

        Self {
            cores: or_default(cores, FALLBACK_CORES),
            memory_gb: or_default((memory_gb * 100.0).floor() / 100.0, FALLBACK_MEMORY_GB),
            disk_gb: or_default(disk_gb.floor(), FALLBACK_DISK_GB),
        }
    }
}

fn amounts(key: &str, value: f64) -> Amounts {
    let mut map = Amounts::new();
    map.insert(key.to_string(), value);
    map
}

/// Build the default resource set for the given host capacity.
pub fn default_resources_for(host: HostCapacity) -> Vec<Resource> {
    vec![
        Resource::new("cpu", "CPU cores", ResourceType::Cpu, amounts("cores", host.cores))
            .with_metadata("source", "host"),
        Resource::new("memory", "System memory", ResourceType::Memory, amounts("gb", host.memory_gb))
            .with_metadata("source", "host"),
        Resource::new("disk", "Local disk", ResourceType::Disk, amounts("gb", host.disk_gb))
            .with_metadata("source", "host"),
        Resource::new(
            "network",
            "Network bandwidth",
            ResourceType::Network,
            amounts("mbps", DEFAULT_NETWORK_MBPS),
        )
        .with_metadata("source", "default"),
        Resource::new(
            "api_quota",
            "External API quota",
            ResourceType::ApiQuota,
            amounts("requests", DEFAULT_API_REQUESTS),
        )
        .with_metadata("source", "default"),
    ]
}

/// Default resources for the current host.
pub fn default_resources() -> Vec<Resource> {
    let host = HostCapacity::detect();
    info!(
        cores = host.cores,
        memory_gb = host.memory_gb,
        disk_gb = host.disk_gb,
        "bootstrapping default resources from host"
    );
    default_resources_for(host)
}
