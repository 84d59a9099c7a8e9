//! Instance endpoints: start, stop, status, route.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::api::error::ApiError;
use crate::api::tenant::TenantContext;
use crate::lifecycle::LifecycleError;
use crate::ports::PortError;
use crate::state::AppState;
use crate::store::Instance;
use crate::workload::{ArtifactKind, WorkloadType};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workloads/{workload}/start", post(start_workload))
        .route("/workloads/{workload}/stop", post(stop_workload))
        .route("/workloads/{workload}/route", get(workload_route))
        .route("/status", get(tenant_status))
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct InstanceResponse {
    pub workload: WorkloadType,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_healthy_at: Option<i64>,
    pub restart_count: u32,
    /// When the instance entered its current state (Unix seconds).
    pub since: i64,
}

impl From<Instance> for InstanceResponse {
    fn from(instance: Instance) -> Self {
        Self {
            workload: instance.workload,
            state: instance.state.as_str().to_string(),
            port: instance.port,
            container_id: instance.container_id,
            created_at: instance.created_at,
            last_healthy_at: instance.last_healthy_at,
            restart_count: instance.restart_count,
            since: instance.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct StatusResponse {
    pub tenant: String,
    pub instances: Vec<InstanceResponse>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RouteResponse {
    pub workload: WorkloadType,
    pub upstream: String,
    pub port: u16,
    pub artifact: ArtifactKind,
}

async fn start_workload(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(workload): Path<String>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let workload = parse_workload(&workload, &ctx)?;
    info!(tenant = %ctx.tenant, workload = %workload,
        request_id = %ctx.request_id, "start requested");

    let instance = state
        .lifecycle()
        .start(&ctx.tenant, workload)
        .await
        .map_err(|err| lifecycle_error(err, &ctx))?;
    Ok(Json(instance.into()))
}

async fn stop_workload(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(workload): Path<String>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let workload = parse_workload(&workload, &ctx)?;
    info!(tenant = %ctx.tenant, workload = %workload,
        request_id = %ctx.request_id, "stop requested");

    let instance = state
        .lifecycle()
        .stop(&ctx.tenant, workload)
        .await
        .map_err(|err| lifecycle_error(err, &ctx))?;
    Ok(Json(instance.into()))
}

async fn tenant_status(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> Result<Json<StatusResponse>, ApiError> {
    let instances = state
        .lifecycle()
        .status(&ctx.tenant)
        .map_err(|err| lifecycle_error(err, &ctx))?;

    Ok(Json(StatusResponse {
        tenant: ctx.tenant,
        instances: instances.into_iter().map(Into::into).collect(),
    }))
}

/// Where this tenant's workload is currently reachable. Only a
/// `Running` instance resolves; everything else is 404.
async fn workload_route(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(workload): Path<String>,
) -> Result<Json<RouteResponse>, ApiError> {
    let workload = parse_workload(&workload, &ctx)?;

    let target = state.routes().resolve(&ctx.tenant, workload).ok_or_else(|| {
        ApiError::not_found("route_not_found", "workload has no running instance")
            .with_request_id(ctx.request_id.clone())
    })?;

    Ok(Json(RouteResponse {
        workload,
        upstream: target.upstream(),
        port: target.host_port,
        artifact: target.artifact,
    }))
}

fn parse_workload(raw: &str, ctx: &TenantContext) -> Result<WorkloadType, ApiError> {
    WorkloadType::parse(raw).ok_or_else(|| {
        ApiError::bad_request("unknown_workload", format!("unknown workload type '{raw}'"))
            .with_request_id(ctx.request_id.clone())
    })
}

fn lifecycle_error(err: LifecycleError, ctx: &TenantContext) -> ApiError {
    let api_err = match &err {
        LifecycleError::QuotaExceeded { limit, .. } => ApiError::too_many_requests(
            "quota_exceeded",
            format!("tenant is at its limit of {limit} active instances"),
        ),
        LifecycleError::Conflict(state) => ApiError::conflict(
            "instance_conflict",
            format!("instance is currently {state}"),
        )
        .with_retry_after_seconds(5),
        LifecycleError::NotFound => {
            ApiError::not_found("instance_not_found", "no instance for this workload")
        }
        LifecycleError::Ports(PortError::Exhausted { .. }) => {
            ApiError::too_many_requests("ports_exhausted", "no host ports available")
                .with_retry_after_seconds(30)
        }
        LifecycleError::Ports(_) => ApiError::internal("port_error", err.to_string()),
        LifecycleError::Runtime(runtime_err) if runtime_err.is_unavailable() => {
            ApiError::service_unavailable("runtime_unavailable", runtime_err.to_string())
        }
        LifecycleError::Runtime(_) => ApiError::internal("runtime_error", err.to_string()),
        LifecycleError::Store(_) => ApiError::internal("store_error", err.to_string()),
    };
    api_err.with_request_id(ctx.request_id.clone())
}
