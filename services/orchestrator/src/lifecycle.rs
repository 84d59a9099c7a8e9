//! Instance lifecycle: start and stop.
//!
//! The lifecycle manager drives the happy paths Requested ->
//! Provisioning -> Running and Running -> Stopping -> Stopped. Every
//! state write is a compare-and-swap against the state observed at the
//! start of the step, so a concurrent request or reconciler pass makes
//! this writer lose cleanly instead of corrupting the record. Failure
//! handling after a step has partially completed belongs to the
//! reconciler, not to the request path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::ports::{PortAllocator, PortError};
use crate::routing::RoutingTable;
use crate::runtime::{ContainerHandle, Runtime, RuntimeError};
use crate::store::{ClaimOutcome, Instance, InstanceState, StateStore, StateStoreError};
use crate::workload::WorkloadType;

/// Errors from lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The tenant is at its instance quota.
    #[error("tenant {tenant} is at its limit of {limit} active instances")]
    QuotaExceeded { tenant: String, limit: u32 },

    /// The pair is held by an instance in a state the operation cannot
    /// proceed from. Retryable once the instance settles.
    #[error("instance is {0}, cannot proceed")]
    Conflict(InstanceState),

    /// No instance record for the pair.
    #[error("no instance for this tenant and workload")]
    NotFound,

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error(transparent)]
    Store(#[from] StateStoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Starts and stops instances on behalf of API requests.
pub struct LifecycleManager {
    store: Arc<StateStore>,
    ports: Arc<PortAllocator>,
    runtime: Arc<dyn Runtime>,
    routes: Arc<RoutingTable>,
    stop_grace: Duration,
    max_instances_per_tenant: u32,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<StateStore>,
        ports: Arc<PortAllocator>,
        runtime: Arc<dyn Runtime>,
        routes: Arc<RoutingTable>,
        stop_grace: Duration,
        max_instances_per_tenant: u32,
    ) -> Self {
        Self {
            store,
            ports,
            runtime,
            routes,
            stop_grace,
            max_instances_per_tenant,
        }
    }

    /// Start a workload for a tenant.
    ///
    /// Claims the (tenant, workload) pair, leases a port, creates and
    /// starts the container, and confirms `Running`. A pair that
    /// already has a live instance reports [`LifecycleError::Conflict`]
    /// with its state.
    pub async fn start(
        &self,
        tenant: &str,
        workload: WorkloadType,
    ) -> Result<Instance, LifecycleError> {
        let now = Utc::now().timestamp();

        let mut instance = match self.store.claim(tenant, workload, now)? {
            ClaimOutcome::Claimed(instance) => instance,
            ClaimOutcome::Busy(state) => return Err(LifecycleError::Conflict(state)),
        };

        // Quota check after the claim so the freshly claimed row is
        // counted; roll the claim back if the tenant is over.
        let active = self.store.count_active_by_tenant(tenant)?;
        if active > i64::from(self.max_instances_per_tenant) {
            self.abandon_claim(&mut instance)?;
            return Err(LifecycleError::QuotaExceeded {
                tenant: tenant.to_string(),
                limit: self.max_instances_per_tenant,
            });
        }

        let port = match self.ports.allocate(tenant, workload) {
            Ok(port) => port,
            Err(err) => {
                // Allocation failure is a failed start, not a clean
                // stop; the row stays pinned Failed until reclaimed.
                instance.state = InstanceState::Failed;
                instance.updated_at = Utc::now().timestamp();
                self.store
                    .compare_and_swap(&instance, InstanceState::Requested)?;
                return Err(err.into());
            }
        };

        instance.state = InstanceState::Provisioning;
        instance.port = Some(port);
        instance.updated_at = Utc::now().timestamp();
        if !self
            .store
            .compare_and_swap(&instance, InstanceState::Requested)?
        {
            self.ports.release(port);
            return Err(LifecycleError::Conflict(self.current_state(
                tenant, workload,
            )?));
        }

        match self.provision(&mut instance, port).await {
            Ok(()) => {}
            Err(err) => {
                self.fail_provisioning(&mut instance, port).await?;
                return Err(err.into());
            }
        }

        instance.state = InstanceState::Running;
        let now = Utc::now().timestamp();
        instance.last_healthy_at = Some(now);
        instance.updated_at = now;
        if !self
            .store
            .compare_and_swap(&instance, InstanceState::Provisioning)?
        {
            // The reconciler declared the start dead while we were
            // provisioning; it owns the record now.
            return Err(LifecycleError::Conflict(self.current_state(
                tenant, workload,
            )?));
        }

        info!(tenant, workload = %workload, port, "instance running");
        self.rebuild_routes()?;
        Ok(instance)
    }

    /// Stop a tenant's workload.
    ///
    /// Gives the container the configured grace period, then removes
    /// it regardless and releases the port. Stopping an instance that
    /// is already terminal is a no-op success.
    pub async fn stop(
        &self,
        tenant: &str,
        workload: WorkloadType,
    ) -> Result<Instance, LifecycleError> {
        let mut instance = self
            .store
            .get(tenant, workload)?
            .ok_or(LifecycleError::NotFound)?;

        match instance.state {
            InstanceState::Stopped | InstanceState::Failed => return Ok(instance),
            InstanceState::Running | InstanceState::Unknown => {}
            // A start or another stop is mid-flight; retry once it
            // settles.
            state => return Err(LifecycleError::Conflict(state)),
        }

        let observed = instance.state;
        instance.state = InstanceState::Stopping;
        instance.updated_at = Utc::now().timestamp();
        if !self.store.compare_and_swap(&instance, observed)? {
            return Err(LifecycleError::Conflict(self.current_state(
                tenant, workload,
            )?));
        }
        self.rebuild_routes()?;

        if let Some(id) = instance.container_id.clone() {
            let handle = ContainerHandle::new(id);
            match self.runtime.stop(&handle, self.stop_grace).await {
                Ok(()) => {}
                Err(err) if err.is_unavailable() => {
                    // Leave the record in Stopping; the reconciler
                    // finishes the job once the daemon is back.
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(tenant, workload = %workload, error = %err,
                        "container ignored stop, removing by force");
                }
            }
            self.runtime.remove(&handle).await?;
        }

        if let Some(port) = instance.port {
            self.ports.release(port);
        }

        instance.state = InstanceState::Stopped;
        instance.port = None;
        instance.container_id = None;
        instance.updated_at = Utc::now().timestamp();
        if !self
            .store
            .compare_and_swap(&instance, InstanceState::Stopping)?
        {
            return Err(LifecycleError::Conflict(self.current_state(
                tenant, workload,
            )?));
        }

        info!(tenant, workload = %workload, "instance stopped");
        self.rebuild_routes()?;
        Ok(instance)
    }

    /// All instance records for a tenant.
    pub fn status(&self, tenant: &str) -> Result<Vec<Instance>, LifecycleError> {
        Ok(self.store.list_by_tenant(tenant)?)
    }

    async fn provision(&self, instance: &mut Instance, port: u16) -> Result<(), RuntimeError> {
        let handle = self
            .runtime
            .create(instance.workload, port, &instance.tenant)
            .await?;
        instance.container_id = Some(handle.id.clone());
        instance.updated_at = Utc::now().timestamp();
        // Persist the container id before starting so a crash between
        // the two calls leaves a record the reconciler can match.
        let _ = self
            .store
            .compare_and_swap(instance, InstanceState::Provisioning);

        self.runtime.start(&handle).await
    }

    /// Pin the record as Failed after a provisioning error, removing
    /// whatever was created and releasing the port.
    async fn fail_provisioning(
        &self,
        instance: &mut Instance,
        port: u16,
    ) -> Result<(), LifecycleError> {
        if let Some(id) = instance.container_id.clone() {
            let handle = ContainerHandle::new(id);
            if let Err(err) = self.runtime.remove(&handle).await {
                warn!(tenant = %instance.tenant, workload = %instance.workload,
                    error = %err, "failed to remove container after provisioning error");
            }
        }
        self.ports.release(port);

        instance.state = InstanceState::Failed;
        instance.port = None;
        instance.container_id = None;
        instance.updated_at = Utc::now().timestamp();
        self.store
            .compare_and_swap(instance, InstanceState::Provisioning)?;
        Ok(())
    }

    /// Return a quota-rejected claim to terminal so the pair is
    /// immediately re-claimable. Nothing was provisioned, so this is a
    /// clean stop rather than a failure.
    fn abandon_claim(&self, instance: &mut Instance) -> Result<(), StateStoreError> {
        instance.state = InstanceState::Stopped;
        instance.updated_at = Utc::now().timestamp();
        self.store
            .compare_and_swap(instance, InstanceState::Requested)?;
        Ok(())
    }

    fn current_state(
        &self,
        tenant: &str,
        workload: WorkloadType,
    ) -> Result<InstanceState, StateStoreError> {
        Ok(self
            .store
            .get(tenant, workload)?
            .map(|i| i.state)
            .unwrap_or(InstanceState::Unknown))
    }

    fn rebuild_routes(&self) -> Result<(), StateStoreError> {
        let instances = self.store.list_all()?;
        self.routes.rebuild(&instances);
        Ok(())
    }
}
