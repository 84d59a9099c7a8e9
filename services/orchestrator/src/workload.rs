//! Workload type definitions.
//!
//! The set of agents the backend can run is closed: each variant carries
//! a descriptor with its image reference, the port the container exposes
//! internally, and whether the agent serves a live web UI or writes a
//! persistent log file. Behavior differences between agents are driven
//! off this table, never off runtime inspection of the image.

use serde::{Deserialize, Serialize};

/// Kind of artifact an agent produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// The container serves a live web UI on its internal port.
    WebUi,
    /// The container writes a persistent log file; the internal port
    /// only exposes its analytics endpoint.
    LogFile,
}

/// Static description of one workload variant.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    /// Image used when no override is configured.
    pub default_image: &'static str,
    /// Port the agent listens on inside the container.
    pub internal_port: u16,
    /// What the agent produces.
    pub artifact: ArtifactKind,
}

/// One of the fixed kinds of agent a tenant can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadType {
    DropsMiner,
    PointsMinerV2,
}

impl WorkloadType {
    /// All known workload types.
    pub const ALL: [WorkloadType; 2] = [Self::DropsMiner, Self::PointsMinerV2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DropsMiner => "drops-miner",
            Self::PointsMinerV2 => "points-miner-v2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "drops-miner" => Some(Self::DropsMiner),
            "points-miner-v2" => Some(Self::PointsMinerV2),
            _ => None,
        }
    }

    /// Static descriptor for this workload.
    pub fn descriptor(&self) -> Descriptor {
        match self {
            Self::DropsMiner => Descriptor {
                default_image: "rangermix/twitch-drops-miner:latest",
                internal_port: 8080,
                artifact: ArtifactKind::WebUi,
            },
            Self::PointsMinerV2 => Descriptor {
                default_image: "rdavidoff/twitch-channel-points-miner-v2:latest",
                internal_port: 5000,
                artifact: ArtifactKind::LogFile,
            },
        }
    }
}

impl std::fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
