//! Host-side port leasing.
//!
//! Each instance gets one host port from a configured inclusive range,
//! always the lowest free one. The lease table lives in memory and is
//! seeded from the state store at startup, so a restart never hands a
//! port that a surviving container still holds to someone else. Callers
//! only allocate after the (tenant, workload) pair has been claimed in
//! the store, which is what serializes concurrent starts.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::workload::WorkloadType;

/// Errors from port allocation.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("port range {start}-{end} exhausted")]
    Exhausted { start: u16, end: u16 },

    #[error("port {0} outside configured range")]
    OutOfRange(u16),

    #[error("port {port} already leased to {tenant}/{workload}")]
    AlreadyLeased {
        port: u16,
        tenant: String,
        workload: WorkloadType,
    },

    #[error("port allocator mutex poisoned")]
    Poisoned,
}

/// Who holds a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOwner {
    pub tenant: String,
    pub workload: WorkloadType,
}

/// Lowest-free-port allocator over an inclusive range.
pub struct PortAllocator {
    start: u16,
    end: u16,
    leased: Mutex<BTreeMap<u16, LeaseOwner>>,
}

impl PortAllocator {
    /// Create an allocator over `start..=end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            leased: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<u16, LeaseOwner>>, PortError> {
        self.leased.lock().map_err(|_| PortError::Poisoned)
    }

    /// Lease the lowest free port in the range.
    pub fn allocate(&self, tenant: &str, workload: WorkloadType) -> Result<u16, PortError> {
        let mut leased = self.lock()?;

        for port in self.start..=self.end {
            if !leased.contains_key(&port) {
                leased.insert(
                    port,
                    LeaseOwner {
                        tenant: tenant.to_string(),
                        workload,
                    },
                );
                return Ok(port);
            }
        }

        Err(PortError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Release a lease. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        if let Ok(mut leased) = self.lock() {
            leased.remove(&port);
        }
    }

    /// Re-establish a lease found in the state store at startup.
    pub fn restore(
        &self,
        port: u16,
        tenant: &str,
        workload: WorkloadType,
    ) -> Result<(), PortError> {
        if !(self.start..=self.end).contains(&port) {
            return Err(PortError::OutOfRange(port));
        }

        let mut leased = self.lock()?;
        if let Some(owner) = leased.get(&port) {
            // Restoring the same owner twice is fine (startup retries).
            if owner.tenant == tenant && owner.workload == workload {
                return Ok(());
            }
            return Err(PortError::AlreadyLeased {
                port,
                tenant: owner.tenant.clone(),
                workload: owner.workload,
            });
        }

        leased.insert(
            port,
            LeaseOwner {
                tenant: tenant.to_string(),
                workload,
            },
        );
        Ok(())
    }

    /// Current number of leases.
    pub fn leased_count(&self) -> usize {
        self.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_lowest_free() {
        let ports = PortAllocator::new(5000, 5002);

        assert_eq!(
            ports.allocate("alice", WorkloadType::DropsMiner).unwrap(),
            5000
        );
        assert_eq!(
            ports.allocate("bob", WorkloadType::DropsMiner).unwrap(),
            5001
        );

        ports.release(5000);
        // Freed port is the lowest again.
        assert_eq!(
            ports.allocate("carol", WorkloadType::PointsMinerV2).unwrap(),
            5000
        );
    }

    #[test]
    fn test_exhaustion() {
        let ports = PortAllocator::new(5000, 5001);
        ports.allocate("alice", WorkloadType::DropsMiner).unwrap();
        ports.allocate("bob", WorkloadType::DropsMiner).unwrap();

        let err = ports.allocate("carol", WorkloadType::DropsMiner).unwrap_err();
        assert!(matches!(err, PortError::Exhausted { start: 5000, end: 5001 }));
    }

    #[test]
    fn test_release_is_idempotent() {
        let ports = PortAllocator::new(5000, 5010);
        let port = ports.allocate("alice", WorkloadType::DropsMiner).unwrap();
        ports.release(port);
        ports.release(port);
        assert_eq!(ports.leased_count(), 0);
    }

    #[test]
    fn test_restore() {
        let ports = PortAllocator::new(5000, 5010);
        ports
            .restore(5005, "alice", WorkloadType::DropsMiner)
            .unwrap();

        // Same owner again: no-op.
        ports
            .restore(5005, "alice", WorkloadType::DropsMiner)
            .unwrap();

        // Different owner: rejected while the lease is held.
        let err = ports
            .restore(5005, "bob", WorkloadType::DropsMiner)
            .unwrap_err();
        assert!(matches!(err, PortError::AlreadyLeased { port: 5005, .. }));

        // Allocation skips the restored port.
        assert_eq!(
            ports.allocate("bob", WorkloadType::DropsMiner).unwrap(),
            5000
        );
    }

    #[test]
    fn test_restore_out_of_range() {
        let ports = PortAllocator::new(5000, 5010);
        let err = ports
            .restore(4999, "alice", WorkloadType::DropsMiner)
            .unwrap_err();
        assert!(matches!(err, PortError::OutOfRange(4999)));
    }
}
