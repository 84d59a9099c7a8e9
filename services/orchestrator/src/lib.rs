//! minerd orchestrator.
//!
//! Provisions, supervises, and routes per-tenant miner containers. The
//! state store is the source of truth; the reconciler converges the
//! container runtime to it; the HTTP API is how tenants ask for
//! changes.

pub mod api;
pub mod config;
pub mod lifecycle;
pub mod ports;
pub mod reconciler;
pub mod routing;
pub mod runtime;
pub mod state;
pub mod store;
pub mod workload;
