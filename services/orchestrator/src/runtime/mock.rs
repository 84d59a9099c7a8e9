//! Mock runtime for testing and development.
//!
//! Keeps containers in an in-memory table and offers the fault knobs
//! the lifecycle and reconciler tests need: failing creates or stops,
//! crashing a running container behind the orchestrator's back, and
//! taking the whole daemon "offline".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::workload::WorkloadType;

use super::{
    container_name, ContainerHandle, InspectReport, ManagedContainer, Runtime, RuntimeError,
};

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    name: String,
    tenant: Option<String>,
    workload: Option<WorkloadType>,
    host_port: Option<u16>,
    running: bool,
    exit_code: Option<i64>,
}

/// In-memory runtime double.
#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, MockContainer>>,
    id_counter: AtomicU64,
    fail_creates: AtomicBool,
    fail_starts: AtomicBool,
    fail_stops: AtomicBool,
    unavailable: AtomicBool,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("mock_{counter:016x}")
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("mock daemon offline".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockContainer>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- fault knobs -----------------------------------------------------

    /// Make subsequent `create` calls fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `start` calls fail.
    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `stop` calls fail, as if the container ignored
    /// the stop signal past its grace period.
    pub fn set_fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    /// Take the whole daemon offline (every call errors Unavailable).
    pub fn set_unavailable(&self, offline: bool) {
        self.unavailable.store(offline, Ordering::SeqCst);
    }

    /// Kill a running container behind the orchestrator's back.
    pub fn crash(&self, handle: &ContainerHandle, exit_code: i64) {
        let mut containers = self.lock();
        if let Some(container) = containers.get_mut(&handle.id) {
            container.running = false;
            container.exit_code = Some(exit_code);
        }
    }

    /// Plant a container the store knows nothing about.
    pub fn insert_orphan(
        &self,
        tenant: Option<&str>,
        workload: Option<WorkloadType>,
        host_port: Option<u16>,
        running: bool,
    ) -> ContainerHandle {
        let id = self.next_id();
        let name = match (tenant, workload) {
            (Some(t), Some(w)) => container_name(t, w),
            _ => format!("orphan-{id}"),
        };
        let mut containers = self.lock();
        containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name,
                tenant: tenant.map(str::to_string),
                workload,
                host_port,
                running,
                exit_code: None,
            },
        );
        ContainerHandle::new(id)
    }

    // --- test observation ------------------------------------------------

    /// Number of containers the runtime still knows about.
    pub fn container_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of running containers.
    pub fn running_count(&self) -> usize {
        self.lock().values().filter(|c| c.running).count()
    }

    /// Whether a container id still exists.
    pub fn contains(&self, handle: &ContainerHandle) -> bool {
        self.lock().contains_key(&handle.id)
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn create(
        &self,
        workload: WorkloadType,
        host_port: u16,
        tenant: &str,
    ) -> Result<ContainerHandle, RuntimeError> {
        self.check_available()?;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "mock configured to fail creates".to_string(),
            });
        }

        let name = container_name(tenant, workload);
        let mut containers = self.lock();

        // Name conflict behaves like the real daemon: hand back the
        // existing container.
        if let Some(existing) = containers.values().find(|c| c.name == name) {
            return Ok(ContainerHandle::new(existing.id.clone()));
        }

        let id = self.next_id();
        debug!(tenant, workload = %workload, host_port, id = %id, "[MOCK] created container");
        containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name,
                tenant: Some(tenant.to_string()),
                workload: Some(workload),
                host_port: Some(host_port),
                running: false,
                exit_code: None,
            },
        );
        Ok(ContainerHandle::new(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.check_available()?;
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "mock configured to fail starts".to_string(),
            });
        }

        let mut containers = self.lock();
        match containers.get_mut(&handle.id) {
            Some(container) => {
                container.running = true;
                container.exit_code = None;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(handle.id.clone())),
        }
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<(), RuntimeError> {
        self.check_available()?;
        if self.fail_stops.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "mock container ignored stop".to_string(),
            });
        }

        let mut containers = self.lock();
        if let Some(container) = containers.get_mut(&handle.id) {
            container.running = false;
            container.exit_code = Some(0);
        }
        // Already gone is success, mirroring the daemon.
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.check_available()?;
        let mut containers = self.lock();
        containers.remove(&handle.id);
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<InspectReport, RuntimeError> {
        self.check_available()?;
        let containers = self.lock();
        Ok(match containers.get(&handle.id) {
            Some(container) => InspectReport {
                exists: true,
                running: container.running,
                healthy: container.running,
                exit_code: container.exit_code,
            },
            None => InspectReport::default(),
        })
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        self.check_available()?;
        let containers = self.lock();
        Ok(containers
            .values()
            .map(|c| ManagedContainer {
                handle: ContainerHandle::new(c.id.clone()),
                tenant: c.tenant.clone(),
                workload: c.workload,
                running: c.running,
                host_port: c.host_port,
            })
            .collect())
    }
}
