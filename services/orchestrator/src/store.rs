//! SQLite-based state store for tenant instances.
//!
//! This is the durable source of truth for every tenant's instances.
//! The lifecycle manager and the reconciler both mutate instance state
//! exclusively through [`StateStore::compare_and_swap`], so a stale
//! writer always loses and must re-read. The file survives process
//! restarts; on startup the reconciler re-validates every non-terminal
//! record before it is trusted.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, warn};

use crate::workload::WorkloadType;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid state: {0}")]
    Invalid(String),
}

/// Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Start accepted, nothing allocated yet.
    Requested,
    /// Port leased, container being created and started.
    Provisioning,
    /// Container confirmed running.
    Running,
    /// Stop in progress, bounded by the grace period.
    Stopping,
    /// Cleanly stopped. Terminal until reclaimed by a new start.
    Stopped,
    /// Pinned failure. Terminal until reclaimed by a new start.
    Failed,
    /// Drift detected; awaiting reconciliation.
    Unknown,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "provisioning" => Some(Self::Provisioning),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Terminal states stay put until the row is reclaimed by a new
    /// start request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Instance record in the state store.
///
/// At most one row exists per (tenant, workload); the row is reused
/// across successive runs of the same pair, which is what makes the
/// "one non-terminal instance per pair" invariant a primary-key fact
/// rather than a convention.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Opaque tenant identity from the auth collaborator.
    pub tenant: String,
    /// Which agent this instance runs.
    pub workload: WorkloadType,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Leased host port, once allocated.
    pub port: Option<u16>,
    /// Runtime-assigned container identity, once created.
    pub container_id: Option<String>,
    /// Created timestamp (Unix seconds).
    pub created_at: i64,
    /// Last time the reconciler observed the container healthy.
    pub last_healthy_at: Option<i64>,
    /// Restarts performed by the reconciler for this run.
    pub restart_count: u32,
    /// Updated timestamp (Unix seconds).
    pub updated_at: i64,
}

impl Instance {
    /// Fresh record for a newly claimed pair.
    pub fn requested(tenant: &str, workload: WorkloadType, now: i64) -> Self {
        Self {
            tenant: tenant.to_string(),
            workload,
            state: InstanceState::Requested,
            port: None,
            container_id: None,
            created_at: now,
            last_healthy_at: None,
            restart_count: 0,
            updated_at: now,
        }
    }
}

/// Outcome of claiming a (tenant, workload) pair for a new start.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The pair was free (or terminal) and is now `Requested`.
    Claimed(Instance),
    /// A non-terminal instance already holds the pair.
    Busy(InstanceState),
}

const INSTANCE_COLUMNS: &str =
    "tenant, workload, state, port, container_id, created_at, last_healthy_at, restart_count, updated_at";

/// SQLite state store.
///
/// The connection is guarded by a mutex; every call is a single short
/// statement, so contention is bounded by SQLite statement latency.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateStoreError> {
        self.conn
            .lock()
            .map_err(|_| StateStoreError::Invalid("state store mutex poisoned".to_string()))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                tenant TEXT NOT NULL,
                workload TEXT NOT NULL,
                state TEXT NOT NULL,
                port INTEGER,
                container_id TEXT,
                created_at INTEGER NOT NULL,
                last_healthy_at INTEGER,
                restart_count INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tenant, workload)
            );

            CREATE INDEX IF NOT EXISTS idx_instances_state ON instances(state);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Insert or replace an instance record unconditionally.
    ///
    /// Only used for records that cannot race (orphan adoption); state
    /// transitions on live records go through [`Self::compare_and_swap`].
    pub fn put(&self, instance: &Instance) -> Result<(), StateStoreError> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO instances ({INSTANCE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                instance.tenant,
                instance.workload.as_str(),
                instance.state.as_str(),
                instance.port.map(i64::from),
                instance.container_id,
                instance.created_at,
                instance.last_healthy_at,
                instance.restart_count,
                instance.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get the record for a (tenant, workload) pair.
    pub fn get(
        &self,
        tenant: &str,
        workload: WorkloadType,
    ) -> Result<Option<Instance>, StateStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE tenant = ?1 AND workload = ?2"
        ))?;

        let found = stmt
            .query_row(params![tenant, workload.as_str()], row_to_instance)
            .optional()?;
        Ok(found.flatten())
    }

    /// List all instances owned by a tenant.
    pub fn list_by_tenant(&self, tenant: &str) -> Result<Vec<Instance>, StateStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE tenant = ?1 ORDER BY workload"
        ))?;

        let records = stmt
            .query_map(params![tenant], row_to_instance)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records.into_iter().flatten().collect())
    }

    /// List every instance record.
    pub fn list_all(&self) -> Result<Vec<Instance>, StateStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY tenant, workload"
        ))?;

        let records = stmt
            .query_map([], row_to_instance)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records.into_iter().flatten().collect())
    }

    /// Count a tenant's non-terminal instances (quota enforcement).
    pub fn count_active_by_tenant(&self, tenant: &str) -> Result<i64, StateStoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM instances
             WHERE tenant = ?1 AND state NOT IN ('stopped', 'failed')",
            params![tenant],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Write `instance` only if the stored state still equals
    /// `expected`. Returns false when another writer got there first.
    pub fn compare_and_swap(
        &self,
        instance: &Instance,
        expected: InstanceState,
    ) -> Result<bool, StateStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE instances SET
                state = ?1, port = ?2, container_id = ?3, created_at = ?4,
                last_healthy_at = ?5, restart_count = ?6, updated_at = ?7
             WHERE tenant = ?8 AND workload = ?9 AND state = ?10",
            params![
                instance.state.as_str(),
                instance.port.map(i64::from),
                instance.container_id,
                instance.created_at,
                instance.last_healthy_at,
                instance.restart_count,
                instance.updated_at,
                instance.tenant,
                instance.workload.as_str(),
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Atomically claim a (tenant, workload) pair for a new start.
    ///
    /// Inserts a fresh `Requested` row when the pair has never run, or
    /// reclaims the row from a terminal state. A pair with a live
    /// instance reports `Busy` with the conflicting state. Two
    /// concurrent claims for the same pair cannot both succeed: the
    /// insert and the conditional update are each single statements.
    pub fn claim(
        &self,
        tenant: &str,
        workload: WorkloadType,
        now: i64,
    ) -> Result<ClaimOutcome, StateStoreError> {
        let fresh = Instance::requested(tenant, workload, now);

        {
            let conn = self.lock()?;
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO instances ({INSTANCE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    fresh.tenant,
                    fresh.workload.as_str(),
                    fresh.state.as_str(),
                    fresh.port.map(i64::from),
                    fresh.container_id,
                    fresh.created_at,
                    fresh.last_healthy_at,
                    fresh.restart_count,
                    fresh.updated_at,
                ],
            )?;
            if inserted == 1 {
                return Ok(ClaimOutcome::Claimed(fresh));
            }

            let reclaimed = conn.execute(
                "UPDATE instances SET
                    state = 'requested', port = NULL, container_id = NULL,
                    created_at = ?1, last_healthy_at = NULL, restart_count = 0, updated_at = ?1
                 WHERE tenant = ?2 AND workload = ?3 AND state IN ('stopped', 'failed')",
                params![now, tenant, workload.as_str()],
            )?;
            if reclaimed == 1 {
                return Ok(ClaimOutcome::Claimed(fresh));
            }
        }

        match self.get(tenant, workload)? {
            Some(existing) => Ok(ClaimOutcome::Busy(existing.state)),
            // Row vanished between statements; treat as a lost race.
            None => Ok(ClaimOutcome::Busy(InstanceState::Requested)),
        }
    }
}

/// Decode one row, or `None` when the workload or state column holds a
/// value no release ever wrote. Such a row is corrupt; attributing it
/// to a real workload would collide with a genuine record, so it is
/// skipped and logged instead.
fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Instance>> {
    let tenant: String = row.get(0)?;
    let workload_str: String = row.get(1)?;
    let state_str: String = row.get(2)?;
    let port: Option<i64> = row.get(3)?;

    let Some(workload) = WorkloadType::parse(&workload_str) else {
        warn!(tenant, workload = %workload_str, "skipping row with unknown workload");
        return Ok(None);
    };
    let Some(state) = InstanceState::parse(&state_str) else {
        warn!(tenant, state = %state_str, "skipping row with unknown state");
        return Ok(None);
    };

    Ok(Some(Instance {
        tenant,
        workload,
        state,
        port: port.and_then(|p| u16::try_from(p).ok()),
        container_id: row.get(4)?,
        created_at: row.get(5)?,
        last_healthy_at: row.get(6)?,
        restart_count: row.get(7)?,
        updated_at: row.get(8)?,
    }))
}
