//! Tenant identity extracted from HTTP requests.
//!
//! Authentication proper lives in a fronting gateway; by the time a
//! request reaches this service the gateway has resolved the caller
//! and stamped `X-Tenant-Id`. Handlers never trust any other part of
//! the request for identity, and a tenant can only ever act on its own
//! instances because every store query is keyed by this value.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::api::error::ApiError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Tenant ids flow into container names, so the charset is restricted
/// to what the runtime accepts there.
const MAX_TENANT_LEN: usize = 64;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant: String,
    pub request_id: String,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn generate_request_id() -> String {
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("req_{nanos:x}{counter:04x}")
}

fn valid_tenant(tenant: &str) -> bool {
    if tenant.is_empty() || tenant.len() > MAX_TENANT_LEN {
        return false;
    }
    let mut chars = tenant.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id =
            header_string(&parts.headers, REQUEST_ID_HEADER).unwrap_or_else(generate_request_id);

        let Some(tenant) = header_string(&parts.headers, TENANT_HEADER) else {
            return Err(ApiError::unauthorized(
                "missing_tenant",
                "X-Tenant-Id header is required",
            )
            .with_request_id(request_id));
        };

        if !valid_tenant(&tenant) {
            return Err(ApiError::bad_request(
                "invalid_tenant",
                "tenant id must be 1-64 characters of [a-zA-Z0-9_-], starting alphanumeric",
            )
            .with_request_id(request_id));
        }

        Ok(Self { tenant, request_id })
    }
}
