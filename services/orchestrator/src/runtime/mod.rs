//! Container runtime interface.
//!
//! The runtime adapter is the only path through which the orchestrator
//! touches the container runtime. Containers it owns carry a label
//! convention so [`Runtime::list_managed`] never enumerates unrelated
//! host containers. Every operation either is idempotent or tolerates
//! "already in that state" answers, because the reconciler retries.
//!
//! Two implementations: [`DockerRuntime`] against the Docker Engine
//! Unix socket, and [`MockRuntime`] for tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::workload::WorkloadType;

pub mod docker;
pub mod mock;

pub use docker::DockerRuntime;
pub use mock::MockRuntime;

/// Label marking a container as owned by this orchestrator.
pub const MANAGED_LABEL: &str = "dev.minerd.managed";
/// Label carrying the owning tenant id.
pub const TENANT_LABEL: &str = "dev.minerd.tenant";
/// Label carrying the workload type.
pub const WORKLOAD_LABEL: &str = "dev.minerd.workload";

/// Handle to a container known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Runtime-assigned container identity.
    pub id: String,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Result of inspecting a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct InspectReport {
    /// The runtime still knows this container.
    pub exists: bool,
    /// The container process is running.
    pub running: bool,
    /// Health status, where the image defines a health check;
    /// otherwise mirrors `running`.
    pub healthy: bool,
    /// Exit code, once the container has stopped.
    pub exit_code: Option<i64>,
}

/// A labeled container discovered via [`Runtime::list_managed`].
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub handle: ContainerHandle,
    /// Tenant label, if intact.
    pub tenant: Option<String>,
    /// Workload label, if intact and recognized.
    pub workload: Option<WorkloadType>,
    pub running: bool,
    /// Published host port, if any.
    pub host_port: Option<u16>,
}

/// Errors from runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime daemon cannot be reached at all.
    #[error("container runtime unreachable: {0}")]
    Unavailable(String),

    /// A call exceeded its bounded timeout.
    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),

    /// The runtime answered with an error status.
    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The container does not exist (where that is not tolerable).
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// True when the failure is about reaching the daemon rather than
    /// about the request itself. Lifecycle callers fail fast on these;
    /// the reconciler retries on its own schedule.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Container runtime operations.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create a container for the workload, publishing its internal
    /// port on `host_port` (loopback only), labeled for `tenant`.
    /// Creating a container that already exists for the pair returns
    /// the existing handle.
    async fn create(
        &self,
        workload: WorkloadType,
        host_port: u16,
        tenant: &str,
    ) -> Result<ContainerHandle, RuntimeError>;

    /// Start the container. Already-running is success.
    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Stop the container, allowing up to `grace` before the runtime
    /// kills it. Already-stopped or already-gone is success.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError>;

    /// Force-remove the container. Already-gone is success.
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Observe the container's actual state. A missing container is a
    /// successful report with `exists: false`, not an error.
    async fn inspect(&self, handle: &ContainerHandle) -> Result<InspectReport, RuntimeError>;

    /// Enumerate containers carrying the managed label, running or not.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;
}

/// Deterministic container name for a (tenant, workload) pair.
pub fn container_name(tenant: &str, workload: WorkloadType) -> String {
    format!("minerd-{}-{}", tenant, workload.as_str())
}
