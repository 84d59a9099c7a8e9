//! Reconciliation between the state store and the container runtime.
//!
//! The reconciler runs one pass at startup, before the API starts
//! serving, and then periodically. Each pass observes every instance
//! record and every labeled container, repairs drift, and rebuilds the
//! routing table. Repairs are idempotent: a pass over a converged
//! system performs no transitions.
//!
//! Drift repairs:
//! - Running record, container dead or missing: mark Unknown, then
//!   restart within the persisted budget or pin Failed beyond it.
//! - Provisioning or Requested record older than the provisioning
//!   timeout: the start attempt died with its process; pin Failed.
//! - Stopping record older than the grace period: finish the stop by
//!   force.
//! - Labeled container with no live record: orphan; removed or adopted
//!   per policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use minerd_reconcile::{PassSummary, ReconcileError, RetryTracker, DEFAULT_RETRY_WINDOW};

use crate::config::OrphanPolicy;
use crate::ports::PortAllocator;
use crate::routing::RoutingTable;
use crate::runtime::{ContainerHandle, ManagedContainer, Runtime, RuntimeError};
use crate::store::{Instance, InstanceState, StateStore};
use crate::workload::WorkloadType;

fn runtime_err(err: RuntimeError) -> ReconcileError {
    match err {
        RuntimeError::Timeout(elapsed) => ReconcileError::Timeout {
            resource: "container runtime".to_string(),
            elapsed,
        },
        other => ReconcileError::Internal(other.to_string()),
    }
}

/// Reconciler configuration, lifted from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    pub provisioning_timeout: Duration,
    pub stop_grace: Duration,
    pub max_restarts: u32,
    pub orphan_policy: OrphanPolicy,
}

/// Converges actual container state to the state store.
pub struct Reconciler {
    store: Arc<StateStore>,
    ports: Arc<PortAllocator>,
    runtime: Arc<dyn Runtime>,
    routes: Arc<RoutingTable>,
    settings: ReconcilerSettings,
    retries: Mutex<RetryTracker>,
}

impl Reconciler {
    pub fn new(
        store: Arc<StateStore>,
        ports: Arc<PortAllocator>,
        runtime: Arc<dyn Runtime>,
        routes: Arc<RoutingTable>,
        settings: ReconcilerSettings,
    ) -> Self {
        let retries = Mutex::new(RetryTracker::new(
            settings.max_restarts,
            DEFAULT_RETRY_WINDOW,
        ));
        Self {
            store,
            ports,
            runtime,
            routes,
            settings,
            retries,
        }
    }

    /// Startup reconciliation: re-establish port leases from the store,
    /// then run a full pass. Must complete before the API serves
    /// traffic, so requests never act on stale records.
    pub async fn startup(&self) -> Result<PassSummary, ReconcileError> {
        let records = self
            .store
            .list_all()
            .map_err(|e| ReconcileError::Internal(e.to_string()))?;

        for record in &records {
            if record.state.is_terminal() {
                continue;
            }
            if let Some(port) = record.port {
                if let Err(err) = self.ports.restore(port, &record.tenant, record.workload) {
                    warn!(tenant = %record.tenant, workload = %record.workload,
                        port, error = %err, "could not restore port lease");
                }
            }
        }

        let summary = self.pass().await?;
        info!(
            transitions = summary.transitions,
            restarted = summary.restarted,
            failed = summary.failed,
            orphans_removed = summary.orphans_removed,
            orphans_adopted = summary.orphans_adopted,
            "startup reconciliation complete"
        );
        Ok(summary)
    }

    /// Periodic reconciliation loop. Exits when shutdown is signaled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; startup already reconciled.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.pass().await {
                        Ok(summary) if summary.changed_anything() => {
                            info!(
                                status = ?summary.status(),
                                transitions = summary.transitions,
                                restarted = summary.restarted,
                                failed = summary.failed,
                                orphans_removed = summary.orphans_removed,
                                orphans_adopted = summary.orphans_adopted,
                                "reconciliation pass repaired drift"
                            );
                        }
                        Ok(_) => debug!("reconciliation pass: converged"),
                        Err(err) => warn!(error = %err, "reconciliation pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One reconciliation pass.
    pub async fn pass(&self) -> Result<PassSummary, ReconcileError> {
        let mut summary = PassSummary::default();
        let now = Utc::now().timestamp();

        let records = self
            .store
            .list_all()
            .map_err(|e| ReconcileError::Internal(e.to_string()))?;
        let containers = self.runtime.list_managed().await.map_err(runtime_err)?;

        let by_id: HashMap<&str, &ManagedContainer> = containers
            .iter()
            .map(|c| (c.handle.id.as_str(), c))
            .collect();

        for record in &records {
            match record.state {
                InstanceState::Stopped | InstanceState::Failed => {}
                InstanceState::Requested | InstanceState::Provisioning => {
                    self.check_stuck_start(record, now, &mut summary).await?;
                }
                InstanceState::Stopping => {
                    self.check_stuck_stop(record, now, &mut summary).await?;
                }
                InstanceState::Running => {
                    self.check_running(record, now, &by_id, &mut summary)
                        .await?;
                }
                InstanceState::Unknown => {
                    self.recover(record.clone(), now, &mut summary).await?;
                }
            }
        }

        self.sweep_orphans(&records, &containers, now, &mut summary)
            .await?;

        let records = self
            .store
            .list_all()
            .map_err(|e| ReconcileError::Internal(e.to_string()))?;
        self.routes.rebuild(&records);

        if let Ok(mut retries) = self.retries.lock() {
            retries.prune();
        }

        Ok(summary)
    }

    /// A Requested or Provisioning record older than the provisioning
    /// timeout means the start attempt is dead (caller crashed or hung
    /// past any plausible retry). Clean up and pin Failed.
    async fn check_stuck_start(
        &self,
        record: &Instance,
        now: i64,
        summary: &mut PassSummary,
    ) -> Result<(), ReconcileError> {
        let age = now.saturating_sub(record.updated_at);
        if age < self.settings.provisioning_timeout.as_secs() as i64 {
            return Ok(());
        }

        warn!(tenant = %record.tenant, workload = %record.workload,
            state = %record.state, age_secs = age, "start attempt timed out");

        if let Some(id) = record.container_id.clone() {
            if let Err(err) = self.runtime.remove(&ContainerHandle::new(id)).await {
                warn!(tenant = %record.tenant, error = %err,
                    "failed to remove container of timed-out start");
            }
        }
        if let Some(port) = record.port {
            self.ports.release(port);
        }

        let mut updated = record.clone();
        updated.state = InstanceState::Failed;
        updated.port = None;
        updated.container_id = None;
        updated.updated_at = now;
        if self.cas(&updated, record.state)? {
            summary.transitions += 1;
            summary.failed += 1;
        }
        Ok(())
    }

    /// A Stopping record past the grace period means the stop never
    /// finished. Remove by force and settle on Stopped.
    async fn check_stuck_stop(
        &self,
        record: &Instance,
        now: i64,
        summary: &mut PassSummary,
    ) -> Result<(), ReconcileError> {
        let age = now.saturating_sub(record.updated_at);
        if age < self.settings.stop_grace.as_secs() as i64 {
            return Ok(());
        }

        if let Some(id) = record.container_id.clone() {
            if let Err(err) = self.runtime.remove(&ContainerHandle::new(id)).await {
                warn!(tenant = %record.tenant, error = %err,
                    "failed to force-remove stopping container");
                return Ok(());
            }
        }
        if let Some(port) = record.port {
            self.ports.release(port);
        }

        let mut updated = record.clone();
        updated.state = InstanceState::Stopped;
        updated.port = None;
        updated.container_id = None;
        updated.updated_at = now;
        if self.cas(&updated, InstanceState::Stopping)? {
            info!(tenant = %record.tenant, workload = %record.workload,
                "finished interrupted stop");
            summary.transitions += 1;
        }
        Ok(())
    }

    /// Confirm a Running record against the actual container. Healthy
    /// containers refresh `last_healthy_at`; dead or missing ones go to
    /// Unknown and straight into recovery.
    async fn check_running(
        &self,
        record: &Instance,
        now: i64,
        by_id: &HashMap<&str, &ManagedContainer>,
        summary: &mut PassSummary,
    ) -> Result<(), ReconcileError> {
        let alive = record
            .container_id
            .as_deref()
            .and_then(|id| by_id.get(id))
            .map(|c| c.running)
            .unwrap_or(false);

        if alive {
            let mut updated = record.clone();
            updated.last_healthy_at = Some(now);
            // A refresh is not a transition; updated_at keeps marking
            // when the instance entered Running.
            self.cas(&updated, InstanceState::Running)?;
            return Ok(());
        }

        warn!(tenant = %record.tenant, workload = %record.workload,
            container_id = ?record.container_id, "running instance drifted");

        let mut updated = record.clone();
        updated.state = InstanceState::Unknown;
        updated.updated_at = now;
        if !self.cas(&updated, InstanceState::Running)? {
            return Ok(());
        }
        summary.transitions += 1;

        self.recover(updated, now, summary).await
    }

    /// Try to bring an Unknown instance back to Running, bounded by the
    /// restart budget. Beyond the budget the instance is pinned Failed
    /// and its resources released.
    async fn recover(
        &self,
        mut record: Instance,
        now: i64,
        summary: &mut PassSummary,
    ) -> Result<(), ReconcileError> {
        let key = format!("{}/{}", record.tenant, record.workload);

        let storm = self
            .retries
            .lock()
            .map(|t| t.is_exhausted(&key))
            .unwrap_or(false);
        if record.restart_count >= self.settings.max_restarts || storm {
            return self.pin_failed(record, now, summary).await;
        }

        let Some(port) = record.port else {
            return self.pin_failed(record, now, summary).await;
        };

        // The container may be gone entirely; recreate under the same
        // lease before starting.
        let handle = match record.container_id.clone() {
            Some(id) => {
                let handle = ContainerHandle::new(id);
                let report = self.runtime.inspect(&handle).await.map_err(runtime_err)?;
                if report.exists {
                    handle
                } else {
                    self.runtime
                        .create(record.workload, port, &record.tenant)
                        .await
                        .map_err(runtime_err)?
                }
            }
            None => self
                .runtime
                .create(record.workload, port, &record.tenant)
                .await
                .map_err(runtime_err)?,
        };

        if let Err(err) = self.runtime.start(&handle).await {
            warn!(tenant = %record.tenant, workload = %record.workload,
                error = %err, "restart attempt failed");
            if let Ok(mut retries) = self.retries.lock() {
                retries.record_failure(&key);
            }
            record.restart_count += 1;
            record.updated_at = now;
            self.cas(&record, InstanceState::Unknown)?;
            return Ok(());
        }

        if let Ok(mut retries) = self.retries.lock() {
            retries.record_failure(&key);
        }

        record.state = InstanceState::Running;
        record.container_id = Some(handle.id);
        record.restart_count += 1;
        record.last_healthy_at = Some(now);
        record.updated_at = now;
        if self.cas(&record, InstanceState::Unknown)? {
            info!(tenant = %record.tenant, workload = %record.workload,
                restart_count = record.restart_count, "instance restarted");
            summary.transitions += 1;
            summary.restarted += 1;
        }
        Ok(())
    }

    async fn pin_failed(
        &self,
        mut record: Instance,
        now: i64,
        summary: &mut PassSummary,
    ) -> Result<(), ReconcileError> {
        if let Some(id) = record.container_id.clone() {
            if let Err(err) = self.runtime.remove(&ContainerHandle::new(id)).await {
                warn!(tenant = %record.tenant, error = %err,
                    "failed to remove container of failed instance");
            }
        }
        if let Some(port) = record.port {
            self.ports.release(port);
        }

        let observed = record.state;
        record.state = InstanceState::Failed;
        record.port = None;
        record.container_id = None;
        record.updated_at = now;
        if self.cas(&record, observed)? {
            warn!(tenant = %record.tenant, workload = %record.workload,
                restart_count = record.restart_count, "instance pinned failed");
            summary.transitions += 1;
            summary.failed += 1;
        }
        Ok(())
    }

    /// Containers carrying the managed label but matching no live
    /// record are orphans. Policy decides their fate.
    async fn sweep_orphans(
        &self,
        records: &[Instance],
        containers: &[ManagedContainer],
        now: i64,
        summary: &mut PassSummary,
    ) -> Result<(), ReconcileError> {
        for container in containers {
            let claimed = match (container.tenant.as_deref(), container.workload) {
                // The records snapshot predates list_managed; a start
                // may have claimed the pair and created this container
                // in between. Re-read the pair before touching it.
                (Some(tenant), Some(workload)) => {
                    records.iter().any(|r| {
                        r.tenant == tenant && r.workload == workload && !r.state.is_terminal()
                    }) || self.pair_is_live(tenant, workload)?
                }
                // Labels stripped or unrecognized: never claimable.
                _ => false,
            };
            if claimed {
                continue;
            }

            match self.settings.orphan_policy {
                OrphanPolicy::Remove => {
                    info!(container_id = %container.handle.id, "removing orphan container");
                    if let Err(err) = self.runtime.remove(&container.handle).await {
                        warn!(container_id = %container.handle.id, error = %err,
                            "failed to remove orphan");
                        continue;
                    }
                    summary.orphans_removed += 1;
                }
                OrphanPolicy::Adopt => {
                    if self.adopt(container, now)? {
                        summary.orphans_adopted += 1;
                    } else {
                        if let Err(err) = self.runtime.remove(&container.handle).await {
                            warn!(container_id = %container.handle.id, error = %err,
                                "failed to remove unadoptable orphan");
                            continue;
                        }
                        summary.orphans_removed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Current, not snapshotted, view of whether a pair has a
    /// non-terminal record.
    fn pair_is_live(&self, tenant: &str, workload: WorkloadType) -> Result<bool, ReconcileError> {
        let fresh = self
            .store
            .get(tenant, workload)
            .map_err(|e| ReconcileError::Internal(e.to_string()))?;
        Ok(fresh.is_some_and(|r| !r.state.is_terminal()))
    }

    /// Adoption requires intact labels, a running container, and a
    /// restorable port lease. Anything less gets removed instead.
    fn adopt(&self, container: &ManagedContainer, now: i64) -> Result<bool, ReconcileError> {
        let (Some(tenant), Some(workload)) = (container.tenant.as_deref(), container.workload)
        else {
            return Ok(false);
        };
        if !container.running {
            return Ok(false);
        }
        let Some(port) = container.host_port else {
            return Ok(false);
        };
        if self.ports.restore(port, tenant, workload).is_err() {
            return Ok(false);
        }

        let mut record = Instance::requested(tenant, workload, now);
        record.state = InstanceState::Running;
        record.port = Some(port);
        record.container_id = Some(container.handle.id.clone());
        record.last_healthy_at = Some(now);
        self.store
            .put(&record)
            .map_err(|e| ReconcileError::Internal(e.to_string()))?;

        info!(tenant, workload = %workload, port, "adopted orphan container");
        Ok(true)
    }

    fn cas(&self, instance: &Instance, expected: InstanceState) -> Result<bool, ReconcileError> {
        self.store
            .compare_and_swap(instance, expected)
            .map_err(|e| ReconcileError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn settings(orphan_policy: OrphanPolicy) -> ReconcilerSettings {
        ReconcilerSettings {
            interval: Duration::from_secs(30),
            provisioning_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(45),
            max_restarts: 3,
            orphan_policy,
        }
    }

    fn reconciler(runtime: Arc<MockRuntime>, policy: OrphanPolicy) -> Reconciler {
        Reconciler::new(
            Arc::new(StateStore::open_in_memory().unwrap()),
            Arc::new(PortAllocator::new(5000, 5009)),
            runtime,
            Arc::new(RoutingTable::new()),
            settings(policy),
        )
    }

    async fn seed_running(rec: &Reconciler, runtime: &MockRuntime, tenant: &str) -> Instance {
        let handle = runtime
            .create(WorkloadType::DropsMiner, 5000, tenant)
            .await
            .unwrap();
        runtime.start(&handle).await.unwrap();

        let now = Utc::now().timestamp();
        let mut record = Instance::requested(tenant, WorkloadType::DropsMiner, now);
        record.state = InstanceState::Running;
        record.port = Some(5000);
        record.container_id = Some(handle.id.clone());
        record.last_healthy_at = Some(now);
        rec.store.put(&record).unwrap();
        rec.ports
            .restore(5000, tenant, WorkloadType::DropsMiner)
            .unwrap();
        record
    }

    #[tokio::test]
    async fn test_converged_pass_changes_nothing() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);
        seed_running(&rec, &runtime, "alice").await;

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary, PassSummary::default());
        assert!(summary.status().is_converged());

        // And again: idempotent.
        let summary = rec.pass().await.unwrap();
        assert_eq!(summary, PassSummary::default());
    }

    #[tokio::test]
    async fn test_crashed_container_is_restarted() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);
        let record = seed_running(&rec, &runtime, "alice").await;

        let handle = ContainerHandle::new(record.container_id.clone().unwrap());
        runtime.crash(&handle, 137);

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.restarted, 1);
        assert_eq!(summary.failed, 0);

        let row = rec
            .store
            .get("alice", WorkloadType::DropsMiner)
            .unwrap()
            .unwrap();
        assert_eq!(row.state, InstanceState::Running);
        assert_eq!(row.restart_count, 1);
        assert_eq!(runtime.running_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion_pins_failed() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);
        let mut record = seed_running(&rec, &runtime, "alice").await;

        // Already burned the whole budget in earlier passes.
        record.restart_count = 3;
        rec.store.put(&record).unwrap();

        let handle = ContainerHandle::new(record.container_id.clone().unwrap());
        runtime.crash(&handle, 1);

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.restarted, 0);

        let row = rec
            .store
            .get("alice", WorkloadType::DropsMiner)
            .unwrap()
            .unwrap();
        assert_eq!(row.state, InstanceState::Failed);
        assert!(row.port.is_none());
        assert_eq!(rec.ports.leased_count(), 0);
        assert!(!runtime.contains(&handle));
        assert!(rec.routes.resolve("alice", WorkloadType::DropsMiner).is_none());
    }

    #[tokio::test]
    async fn test_vanished_container_is_recreated() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);
        let record = seed_running(&rec, &runtime, "alice").await;

        let handle = ContainerHandle::new(record.container_id.clone().unwrap());
        runtime.remove(&handle).await.unwrap();

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.restarted, 1);

        let row = rec
            .store
            .get("alice", WorkloadType::DropsMiner)
            .unwrap()
            .unwrap();
        assert_eq!(row.state, InstanceState::Running);
        assert_ne!(row.container_id, record.container_id);
        assert_eq!(runtime.running_count(), 1);
    }

    #[tokio::test]
    async fn test_stuck_provisioning_times_out() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);

        let old = Utc::now().timestamp() - 600;
        let mut record = Instance::requested("alice", WorkloadType::DropsMiner, old);
        record.state = InstanceState::Provisioning;
        record.port = Some(5000);
        rec.store.put(&record).unwrap();
        rec.ports
            .restore(5000, "alice", WorkloadType::DropsMiner)
            .unwrap();

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.failed, 1);

        let row = rec
            .store
            .get("alice", WorkloadType::DropsMiner)
            .unwrap()
            .unwrap();
        assert_eq!(row.state, InstanceState::Failed);
        assert_eq!(rec.ports.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_fresh_provisioning_left_alone() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);

        let now = Utc::now().timestamp();
        let mut record = Instance::requested("alice", WorkloadType::DropsMiner, now);
        record.state = InstanceState::Provisioning;
        record.port = Some(5000);
        rec.store.put(&record).unwrap();

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.transitions, 0);

        let row = rec
            .store
            .get("alice", WorkloadType::DropsMiner)
            .unwrap()
            .unwrap();
        assert_eq!(row.state, InstanceState::Provisioning);
    }

    #[tokio::test]
    async fn test_stuck_stopping_is_finished() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);

        let handle = runtime
            .create(WorkloadType::DropsMiner, 5000, "alice")
            .await
            .unwrap();

        let old = Utc::now().timestamp() - 600;
        let mut record = Instance::requested("alice", WorkloadType::DropsMiner, old);
        record.state = InstanceState::Stopping;
        record.port = Some(5000);
        record.container_id = Some(handle.id.clone());
        rec.store.put(&record).unwrap();
        rec.ports
            .restore(5000, "alice", WorkloadType::DropsMiner)
            .unwrap();

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.transitions, 1);
        assert_eq!(summary.failed, 0);

        let row = rec
            .store
            .get("alice", WorkloadType::DropsMiner)
            .unwrap()
            .unwrap();
        assert_eq!(row.state, InstanceState::Stopped);
        assert!(!runtime.contains(&handle));
        assert_eq!(rec.ports.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_orphan_removed() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);

        let orphan = runtime.insert_orphan(
            Some("ghost"),
            Some(WorkloadType::DropsMiner),
            Some(5003),
            true,
        );

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.orphans_removed, 1);
        assert!(!runtime.contains(&orphan));
    }

    #[tokio::test]
    async fn test_orphan_adopted() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Adopt);

        let orphan = runtime.insert_orphan(
            Some("ghost"),
            Some(WorkloadType::DropsMiner),
            Some(5003),
            true,
        );

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.orphans_adopted, 1);
        assert!(runtime.contains(&orphan));

        let row = rec
            .store
            .get("ghost", WorkloadType::DropsMiner)
            .unwrap()
            .unwrap();
        assert_eq!(row.state, InstanceState::Running);
        assert_eq!(row.port, Some(5003));
        assert!(rec
            .routes
            .resolve("ghost", WorkloadType::DropsMiner)
            .is_some());

        // Adopted instances are plain instances on the next pass.
        let summary = rec.pass().await.unwrap();
        assert_eq!(summary, PassSummary::default());
    }

    #[tokio::test]
    async fn test_unlabeled_orphan_removed_even_under_adopt() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Adopt);

        let orphan = runtime.insert_orphan(None, None, None, true);

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.orphans_adopted, 0);
        assert_eq!(summary.orphans_removed, 1);
        assert!(!runtime.contains(&orphan));
    }

    #[tokio::test]
    async fn test_orphan_sweep_rereads_store_before_removing() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);

        // A start claimed the pair and created its container after the
        // pass snapshotted the records, so the snapshot is empty while
        // the store already holds a Provisioning row.
        let handle = runtime
            .create(WorkloadType::DropsMiner, 5000, "alice")
            .await
            .unwrap();
        let now = Utc::now().timestamp();
        let mut record = Instance::requested("alice", WorkloadType::DropsMiner, now);
        record.state = InstanceState::Provisioning;
        record.port = Some(5000);
        record.container_id = Some(handle.id.clone());
        rec.store.put(&record).unwrap();

        let containers = runtime.list_managed().await.unwrap();
        let mut summary = PassSummary::default();
        rec.sweep_orphans(&[], &containers, now, &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.orphans_removed, 0);
        assert!(runtime.contains(&handle));
    }

    #[tokio::test]
    async fn test_orphan_sweep_rereads_store_before_adopting() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Adopt);

        let handle = runtime
            .create(WorkloadType::DropsMiner, 5000, "alice")
            .await
            .unwrap();
        let now = Utc::now().timestamp();
        let mut record = Instance::requested("alice", WorkloadType::DropsMiner, now);
        record.state = InstanceState::Provisioning;
        record.port = Some(5000);
        record.container_id = Some(handle.id.clone());
        rec.store.put(&record).unwrap();

        let containers = runtime.list_managed().await.unwrap();
        let mut summary = PassSummary::default();
        rec.sweep_orphans(&[], &containers, now, &mut summary)
            .await
            .unwrap();

        // The mid-flight start still owns the pair; adoption must not
        // overwrite its record.
        assert_eq!(summary.orphans_adopted, 0);
        let row = rec
            .store
            .get("alice", WorkloadType::DropsMiner)
            .unwrap()
            .unwrap();
        assert_eq!(row.state, InstanceState::Provisioning);
    }

    #[tokio::test]
    async fn test_health_refresh_keeps_state_entry_time() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);
        let mut record = seed_running(&rec, &runtime, "alice").await;

        record.updated_at = 1_700_000_000;
        record.last_healthy_at = None;
        rec.store.put(&record).unwrap();

        rec.pass().await.unwrap();

        let row = rec
            .store
            .get("alice", WorkloadType::DropsMiner)
            .unwrap()
            .unwrap();
        assert_eq!(row.updated_at, 1_700_000_000);
        assert!(row.last_healthy_at.unwrap() > 1_700_000_000);
    }

    #[test]
    fn test_runtime_timeouts_surface_as_timeouts() {
        let err = runtime_err(RuntimeError::Timeout(Duration::from_secs(5)));
        assert!(matches!(err, ReconcileError::Timeout { .. }));

        let err = runtime_err(RuntimeError::Unavailable("socket gone".to_string()));
        assert!(matches!(err, ReconcileError::Internal(_)));
    }

    #[tokio::test]
    async fn test_container_of_live_record_is_not_an_orphan() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);
        let record = seed_running(&rec, &runtime, "alice").await;

        let summary = rec.pass().await.unwrap();
        assert_eq!(summary.orphans_removed, 0);
        assert!(runtime.contains(&ContainerHandle::new(record.container_id.unwrap())));
    }

    #[tokio::test]
    async fn test_startup_restores_port_leases() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);
        seed_running(&rec, &runtime, "alice").await;
        rec.ports.release(5000);
        assert_eq!(rec.ports.leased_count(), 0);

        rec.startup().await.unwrap();
        assert_eq!(rec.ports.leased_count(), 1);
        // 5000 is leased again, so the next allocation skips it.
        assert_eq!(
            rec.ports
                .allocate("bob", WorkloadType::DropsMiner)
                .unwrap(),
            5001
        );
    }

    #[tokio::test]
    async fn test_routes_follow_pass() {
        let runtime = Arc::new(MockRuntime::new());
        let rec = reconciler(runtime.clone(), OrphanPolicy::Remove);
        let record = seed_running(&rec, &runtime, "alice").await;

        rec.pass().await.unwrap();
        assert!(rec
            .routes
            .resolve("alice", WorkloadType::DropsMiner)
            .is_some());

        // Crash past the budget: route disappears with the instance.
        let mut exhausted = record.clone();
        exhausted.restart_count = 3;
        rec.store.put(&exhausted).unwrap();
        runtime.crash(&ContainerHandle::new(record.container_id.unwrap()), 1);

        rec.pass().await.unwrap();
        assert!(rec
            .routes
            .resolve("alice", WorkloadType::DropsMiner)
            .is_none());
    }
}
