//! Routing table derived from instance state.
//!
//! The table maps (tenant, workload) to the loopback host port of a
//! running container. It is rebuilt wholesale after every state change
//! and reconciler pass rather than patched incrementally, so it can
//! never disagree with the store for longer than one rebuild.
//!
//! Reads are lock-free via an atomically swapped snapshot; a resolve on
//! the hot path never blocks on a rebuild.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::store::{Instance, InstanceState};
use crate::workload::{ArtifactKind, WorkloadType};

/// Where a tenant's workload traffic should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub tenant: String,
    pub workload: WorkloadType,
    /// Loopback host port the container publishes on.
    pub host_port: u16,
    /// What the workload serves on that port.
    pub artifact: ArtifactKind,
}

impl RouteTarget {
    /// Upstream address for proxying.
    pub fn upstream(&self) -> String {
        format!("127.0.0.1:{}", self.host_port)
    }
}

#[derive(Debug, Default)]
struct RouteSnapshot {
    by_pair: HashMap<(String, WorkloadType), RouteTarget>,
}

impl RouteSnapshot {
    /// Build a snapshot from instance records. Only `Running` instances
    /// with a port become routes; everything else is invisible here.
    fn from_instances(instances: &[Instance]) -> Self {
        let mut by_pair = HashMap::new();

        for instance in instances {
            if instance.state != InstanceState::Running {
                continue;
            }
            let Some(port) = instance.port else {
                continue;
            };
            by_pair.insert(
                (instance.tenant.clone(), instance.workload),
                RouteTarget {
                    tenant: instance.tenant.clone(),
                    workload: instance.workload,
                    host_port: port,
                    artifact: instance.workload.descriptor().artifact,
                },
            );
        }

        Self { by_pair }
    }
}

/// Lock-free routing table.
///
/// Readers load a consistent snapshot; [`RoutingTable::rebuild`] swaps
/// in a fresh one in a single pointer store.
pub struct RoutingTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Replace the whole table from the current instance records.
    pub fn rebuild(&self, instances: &[Instance]) {
        let snapshot = RouteSnapshot::from_instances(instances);
        let route_count = snapshot.by_pair.len();
        self.snapshot.store(Arc::new(snapshot));
        debug!(route_count, "routing table rebuilt");
    }

    /// Resolve a tenant's workload to its running container, if any.
    pub fn resolve(&self, tenant: &str, workload: WorkloadType) -> Option<RouteTarget> {
        let snapshot = self.snapshot.load();
        snapshot
            .by_pair
            .get(&(tenant.to_string(), workload))
            .cloned()
    }

    /// All current routes for a tenant.
    pub fn routes_for_tenant(&self, tenant: &str) -> Vec<RouteTarget> {
        let snapshot = self.snapshot.load();
        let mut routes: Vec<RouteTarget> = snapshot
            .by_pair
            .values()
            .filter(|t| t.tenant == tenant)
            .cloned()
            .collect();
        routes.sort_by_key(|t| t.workload.as_str());
        routes
    }

    /// Number of routes in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot.load().by_pair.len()
    }

    /// Whether the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().by_pair.is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
