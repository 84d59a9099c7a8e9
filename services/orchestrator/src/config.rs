//! Configuration for the orchestrator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use minerd_reconcile::{DEFAULT_MAX_RETRIES, DEFAULT_RECONCILE_INTERVAL};

use crate::workload::WorkloadType;

/// What to do with a labeled container that has no state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// Stop and remove the container.
    #[default]
    Remove,
    /// Re-create a state record for it and keep it running.
    Adopt,
}

impl OrphanPolicy {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "remove" => Ok(Self::Remove),
            "adopt" => Ok(Self::Adopt),
            other => bail!("invalid orphan policy '{other}' (expected 'remove' or 'adopt')"),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub listen_addr: String,

    /// Data directory for the state store.
    pub data_dir: PathBuf,

    /// Docker Engine Unix socket path.
    pub docker_socket: PathBuf,

    /// Inclusive host port range for container publishing.
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Grace period a container gets to exit on stop.
    pub stop_grace: Duration,

    /// Bounded timeout for a single runtime API call.
    pub runtime_timeout: Duration,

    /// Interval between periodic reconciler passes.
    pub reconcile_interval: Duration,

    /// How long an instance may sit in Provisioning before the
    /// reconciler declares the start dead.
    pub provisioning_timeout: Duration,

    /// Restart attempts per instance before giving up.
    pub max_restarts: u32,

    /// Handling of labeled containers with no state record.
    pub orphan_policy: OrphanPolicy,

    /// Concurrent non-terminal instances allowed per tenant.
    pub max_instances_per_tenant: u32,

    /// Per-workload container image overrides.
    pub image_overrides: HashMap<WorkloadType, String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr =
            std::env::var("MINERD_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let data_dir = std::env::var("MINERD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/minerd"));

        let docker_socket = std::env::var("MINERD_DOCKER_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/run/docker.sock"));

        let port_range_start = env_parse("MINERD_PORT_RANGE_START", 5000)?;
        let port_range_end = env_parse("MINERD_PORT_RANGE_END", 5999)?;
        if port_range_start > port_range_end {
            bail!(
                "port range start {} exceeds end {}",
                port_range_start,
                port_range_end
            );
        }

        let stop_grace = Duration::from_secs(env_parse("MINERD_STOP_GRACE_SECS", 45u64)?);
        let runtime_timeout = Duration::from_secs(env_parse("MINERD_RUNTIME_TIMEOUT_SECS", 30u64)?);
        let reconcile_interval = Duration::from_secs(env_parse(
            "MINERD_RECONCILE_INTERVAL_SECS",
            DEFAULT_RECONCILE_INTERVAL.as_secs(),
        )?);
        let provisioning_timeout =
            Duration::from_secs(env_parse("MINERD_PROVISIONING_TIMEOUT_SECS", 120u64)?);

        let max_restarts = env_parse("MINERD_MAX_RESTARTS", DEFAULT_MAX_RETRIES)?;
        let max_instances_per_tenant = env_parse("MINERD_MAX_INSTANCES_PER_TENANT", 2u32)?;

        let orphan_policy = match std::env::var("MINERD_ORPHAN_POLICY") {
            Ok(s) => OrphanPolicy::parse(&s)?,
            Err(_) => OrphanPolicy::default(),
        };

        let mut image_overrides = HashMap::new();
        if let Ok(image) = std::env::var("MINERD_DROPS_MINER_IMAGE") {
            image_overrides.insert(WorkloadType::DropsMiner, image);
        }
        if let Ok(image) = std::env::var("MINERD_POINTS_MINER_IMAGE") {
            image_overrides.insert(WorkloadType::PointsMinerV2, image);
        }

        let log_level = std::env::var("MINERD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            data_dir,
            docker_socket,
            port_range_start,
            port_range_end,
            stop_grace,
            runtime_timeout,
            reconcile_interval,
            provisioning_timeout,
            max_restarts,
            orphan_policy,
            max_instances_per_tenant,
            image_overrides,
            log_level,
        })
    }

    /// Path of the SQLite state store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("minerd.db")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}
