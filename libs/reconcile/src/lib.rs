//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to actual state. Key concepts:
//!
//! - **Desired state**: What the operator asked for (from the state store).
//! - **Actual state**: What the container runtime is really doing.
//! - **Drift**: A detected mismatch between the two.
//!
//! # Invariants
//!
//! - All repair operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - A pass with no drift performs no transitions

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convergence status for a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Everything matched; the pass made no transitions.
    Converged,

    /// Drift was found and repairs were issued this pass.
    Converging,

    /// Drift was found that repairs cannot clear (pinned failures).
    Diverged,

    /// The actual state could not be observed (runtime unreachable).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the pass made no transitions.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if repairs are still in flight.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// Summary of a single reconciliation pass.
///
/// Counters are per pass, not cumulative. A pass that observes no
/// drift reports all zeros, which is how idempotence is asserted in
/// tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Instances moved to a new lifecycle state this pass.
    pub transitions: u32,

    /// Instances restarted after being observed dead.
    pub restarted: u32,

    /// Instances pinned in a terminal failed state this pass.
    pub failed: u32,

    /// Orphaned runtime objects removed.
    pub orphans_removed: u32,

    /// Orphaned runtime objects adopted into the store.
    pub orphans_adopted: u32,
}

impl PassSummary {
    /// Classify the pass outcome.
    pub fn status(&self) -> ConvergenceStatus {
        if self.failed > 0 {
            ConvergenceStatus::Diverged
        } else if self.transitions > 0 || self.orphans_removed > 0 || self.orphans_adopted > 0 {
            ConvergenceStatus::Converging
        } else {
            ConvergenceStatus::Converged
        }
    }

    /// Returns true if the pass changed anything at all.
    pub fn changed_anything(&self) -> bool {
        *self != Self::default()
    }
}

/// Retry tracker for failed repair operations.
///
/// Tracks failures per resource key inside a sliding window so a
/// resource whose repairs keep failing stops being re-attempted every
/// pass. Distinct from any persisted restart budget: this only guards
/// against repair storms within one process lifetime.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        let now = Instant::now();
        if now.duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default repair-retry limit per resource.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default repair-retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
