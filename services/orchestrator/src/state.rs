//! Application state shared across request handlers.

use std::sync::Arc;

use crate::lifecycle::LifecycleManager;
use crate::routing::RoutingTable;
use crate::store::StateStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    lifecycle: LifecycleManager,
    routes: Arc<RoutingTable>,
    store: Arc<StateStore>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        lifecycle: LifecycleManager,
        routes: Arc<RoutingTable>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                lifecycle,
                routes,
                store,
            }),
        }
    }

    /// Get the lifecycle manager.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    /// Get the routing table.
    pub fn routes(&self) -> &RoutingTable {
        &self.inner.routes
    }

    /// Get the state store.
    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }
}
