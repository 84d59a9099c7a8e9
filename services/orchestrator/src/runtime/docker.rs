//! Docker Engine API client over the Unix socket.
//!
//! This implements the [`Runtime`] trait against dockerd's HTTP API at
//! `/var/run/docker.sock`. Only containers carrying the managed label
//! are ever listed or touched.
//!
//! Reference: https://docs.docker.com/engine/api/v1.41/

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::workload::WorkloadType;

use super::{
    container_name, ContainerHandle, InspectReport, ManagedContainer, Runtime, RuntimeError,
    MANAGED_LABEL, TENANT_LABEL, WORKLOAD_LABEL,
};

const API_VERSION: &str = "v1.41";

/// Docker runtime adapter speaking to the daemon's Unix socket.
pub struct DockerRuntime {
    socket_path: String,
    client: Client<UnixConnector>,
    /// Bound on every individual API call, independent of stop grace.
    call_timeout: Duration,
    /// Per-workload image overrides from configuration.
    image_overrides: HashMap<WorkloadType, String>,
}

impl DockerRuntime {
    /// Create a new Docker runtime client.
    pub fn new(
        socket_path: impl Into<String>,
        call_timeout: Duration,
        image_overrides: HashMap<WorkloadType, String>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
            call_timeout,
            image_overrides,
        }
    }

    /// Image reference for a workload (override or descriptor default).
    fn image_for(&self, workload: WorkloadType) -> String {
        self.image_overrides
            .get(&workload)
            .cloned()
            .unwrap_or_else(|| workload.descriptor().default_image.to_string())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(u16, Vec<u8>), RuntimeError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Docker API request");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let request = builder
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))?
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        let status = response.status().as_u16();
        let body = tokio::time::timeout(timeout, hyper::body::to_bytes(response.into_body()))
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))?
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok((status, body.to_vec()))
    }

    fn api_error(status: u16, body: &[u8]) -> RuntimeError {
        #[derive(Deserialize)]
        struct DockerMessage {
            message: String,
        }

        let message = serde_json::from_slice::<DockerMessage>(body)
            .map(|m| m.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).to_string());
        error!(status, message = %message, "Docker API error");
        RuntimeError::Api { status, message }
    }

    /// Resolve a container handle by name (used when a create hits a
    /// name conflict left behind by an earlier attempt).
    async fn handle_by_name(&self, name: &str) -> Result<ContainerHandle, RuntimeError> {
        let path = format!("/{API_VERSION}/containers/{name}/json");
        let (status, body) = self
            .request(Method::GET, &path, None, self.call_timeout)
            .await?;

        if status == 200 {
            let inspected: InspectResponse = serde_json::from_slice(&body)?;
            Ok(ContainerHandle::new(inspected.id))
        } else if status == 404 {
            Err(RuntimeError::NotFound(name.to_string()))
        } else {
            Err(Self::api_error(status, &body))
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn create(
        &self,
        workload: WorkloadType,
        host_port: u16,
        tenant: &str,
    ) -> Result<ContainerHandle, RuntimeError> {
        let name = container_name(tenant, workload);
        let internal_port = workload.descriptor().internal_port;
        let port_key = format!("{internal_port}/tcp");

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(TENANT_LABEL.to_string(), tenant.to_string());
        labels.insert(WORKLOAD_LABEL.to_string(), workload.as_str().to_string());

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key.clone(), serde_json::json!({}));

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key,
            vec![PortBinding {
                // Loopback only: the fronting proxy is the public entry point.
                host_ip: "127.0.0.1".to_string(),
                host_port: host_port.to_string(),
            }],
        );

        let create = CreateRequest {
            image: self.image_for(workload),
            labels,
            exposed_ports,
            host_config: HostConfig { port_bindings },
        };

        let path = format!("/{API_VERSION}/containers/create?name={name}");
        let body = serde_json::to_vec(&create)?;
        let (status, response_body) = self
            .request(Method::POST, &path, Some(body), self.call_timeout)
            .await?;

        match status {
            201 => {
                let created: CreateResponse = serde_json::from_slice(&response_body)?;
                Ok(ContainerHandle::new(created.id))
            }
            // Name conflict: a previous attempt already created it.
            409 => self.handle_by_name(&name).await,
            _ => Err(Self::api_error(status, &response_body)),
        }
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let path = format!("/{API_VERSION}/containers/{}/start", handle.id);
        let (status, body) = self
            .request(Method::POST, &path, None, self.call_timeout)
            .await?;

        match status {
            // 304: already started.
            204 | 304 => Ok(()),
            404 => Err(RuntimeError::NotFound(handle.id.clone())),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        let path = format!(
            "/{API_VERSION}/containers/{}/stop?t={}",
            handle.id,
            grace.as_secs()
        );
        // The daemon holds this request open for up to the grace
        // period before killing, so the call bound must sit above it.
        let timeout = self.call_timeout + grace;
        let (status, body) = self.request(Method::POST, &path, None, timeout).await?;

        match status {
            // 304: already stopped. 404: already gone.
            204 | 304 | 404 => Ok(()),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let path = format!("/{API_VERSION}/containers/{}?force=true&v=true", handle.id);
        let (status, body) = self
            .request(Method::DELETE, &path, None, self.call_timeout)
            .await?;

        match status {
            // 404: already gone.
            204 | 404 => Ok(()),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<InspectReport, RuntimeError> {
        let path = format!("/{API_VERSION}/containers/{}/json", handle.id);
        let (status, body) = self
            .request(Method::GET, &path, None, self.call_timeout)
            .await?;

        match status {
            200 => {
                let inspected: InspectResponse = serde_json::from_slice(&body)?;
                Ok(inspected.into_report())
            }
            404 => Ok(InspectReport::default()),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let filters = serde_json::json!({ "label": [format!("{MANAGED_LABEL}=true")] });
        let path = format!(
            "/{API_VERSION}/containers/json?all=true&filters={}",
            percent_encode(&filters.to_string())
        );
        let (status, body) = self
            .request(Method::GET, &path, None, self.call_timeout)
            .await?;

        if status != 200 {
            return Err(Self::api_error(status, &body));
        }

        let summaries: Vec<ContainerSummary> = serde_json::from_slice(&body)?;
        Ok(summaries.into_iter().map(ContainerSummary::into_managed).collect())
    }
}

/// Percent-encode a query value (RFC 3986 unreserved set passes through).
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct CreateRequest {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Labels")]
    labels: HashMap<String, String>,
    #[serde(rename = "ExposedPorts")]
    exposed_ports: HashMap<String, serde_json::Value>,
    #[serde(rename = "HostConfig")]
    host_config: HostConfig,
}

#[derive(Debug, Serialize)]
struct HostConfig {
    #[serde(rename = "PortBindings")]
    port_bindings: HashMap<String, Vec<PortBinding>>,
}

#[derive(Debug, Serialize)]
struct PortBinding {
    #[serde(rename = "HostIp")]
    host_ip: String,
    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State", default)]
    state: Option<ContainerState>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerState {
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i64>,
    #[serde(rename = "Health", default)]
    health: Option<HealthState>,
}

#[derive(Debug, Deserialize)]
struct HealthState {
    #[serde(rename = "Status", default)]
    status: String,
}

impl InspectResponse {
    fn into_report(self) -> InspectReport {
        let state = self.state.unwrap_or_default();
        let healthy = match &state.health {
            Some(health) => health.status == "healthy",
            // Images without a health check: running is the best signal.
            None => state.running,
        };
        InspectReport {
            exists: true,
            running: state.running,
            healthy,
            exit_code: if state.running { None } else { state.exit_code },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Ports", default)]
    ports: Vec<SummaryPort>,
}

#[derive(Debug, Deserialize)]
struct SummaryPort {
    #[serde(rename = "PublicPort", default)]
    public_port: Option<u16>,
    #[serde(rename = "Type", default)]
    kind: String,
}

impl ContainerSummary {
    fn into_managed(self) -> ManagedContainer {
        let workload = self
            .labels
            .get(WORKLOAD_LABEL)
            .and_then(|s| WorkloadType::parse(s));
        let host_port = self
            .ports
            .iter()
            .find(|p| p.kind == "tcp" && p.public_port.is_some())
            .and_then(|p| p.public_port);

        ManagedContainer {
            handle: ContainerHandle::new(self.id),
            tenant: self.labels.get(TENANT_LABEL).cloned(),
            workload,
            running: self.state == "running",
            host_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("abc-123._~"), "abc-123._~");
        assert_eq!(
            percent_encode(r#"{"label":["a=b"]}"#),
            "%7B%22label%22%3A%5B%22a%3Db%22%5D%7D"
        );
    }

    #[test]
    fn test_inspect_report_mapping() {
        let raw = r#"{
            "Id": "cid-1",
            "State": {"Running": true, "ExitCode": 0, "Health": {"Status": "healthy"}}
        }"#;
        let inspected: InspectResponse = serde_json::from_str(raw).unwrap();
        let report = inspected.into_report();
        assert!(report.exists);
        assert!(report.running);
        assert!(report.healthy);
        assert!(report.exit_code.is_none());
    }

    #[test]
    fn test_inspect_report_exited() {
        let raw = r#"{"Id": "cid-1", "State": {"Running": false, "ExitCode": 137}}"#;
        let inspected: InspectResponse = serde_json::from_str(raw).unwrap();
        let report = inspected.into_report();
        assert!(report.exists);
        assert!(!report.running);
        assert!(!report.healthy);
        assert_eq!(report.exit_code, Some(137));
    }

    #[test]
    fn test_summary_mapping() {
        let raw = format!(
            r#"[{{
                "Id": "cid-9",
                "Labels": {{"{MANAGED_LABEL}": "true", "{TENANT_LABEL}": "alice", "{WORKLOAD_LABEL}": "drops-miner"}},
                "State": "running",
                "Ports": [{{"PrivatePort": 8080, "PublicPort": 5003, "Type": "tcp"}}]
            }}]"#
        );
        let summaries: Vec<ContainerSummary> = serde_json::from_str(&raw).unwrap();
        let managed = summaries.into_iter().next().unwrap().into_managed();
        assert_eq!(managed.tenant.as_deref(), Some("alice"));
        assert_eq!(managed.workload, Some(WorkloadType::DropsMiner));
        assert!(managed.running);
        assert_eq!(managed.host_port, Some(5003));
    }

    #[test]
    fn test_image_override() {
        let mut overrides = HashMap::new();
        overrides.insert(WorkloadType::DropsMiner, "custom/drops:pinned".to_string());
        let runtime = DockerRuntime::new("/var/run/docker.sock", Duration::from_secs(5), overrides);

        assert_eq!(runtime.image_for(WorkloadType::DropsMiner), "custom/drops:pinned");
        assert_eq!(
            runtime.image_for(WorkloadType::PointsMinerV2),
            WorkloadType::PointsMinerV2.descriptor().default_image
        );
    }
}
