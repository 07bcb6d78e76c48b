//! Orchestrator (§1, §6): the abstract external container orchestrator
//!
//! The core treats the underlying scheduler (Nomad, Kubernetes, …) as an
//! opaque collaborator capable of creating/deleting workloads, reading pod
//! state, discovering nodes, streaming logs, and serving the game catalog
//! config document. [`NomadOrchestrator`] is the one concrete adapter,
//! grounded on the teacher's `NomadClient`.

use crate::error::{CoreError, Result};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::resilience::retry::{RetryConfig, RetryPolicy};
use crate::types::{NodeName, Protocol};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};

/// Desired workload to create for a server (§4.5 pending->starting)
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub server_id: String,
    pub node: NodeName,
    pub image: String,
    pub env: HashMap<String, String>,
    pub ports: Vec<(String, u16, Protocol)>,
    pub volume_name: String,
    pub mount_path: String,
}

/// Orchestrator's view of a running workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub exists: bool,
    pub ready: bool,
    pub replicas: u32,
}

/// A reported worker node, prior to role/label filtering by NodeSync
#[derive(Debug, Clone)]
pub struct ReportedNode {
    pub name: NodeName,
    pub public_ip: Option<String>,
    pub ready: bool,
    pub has_gameserver_role: bool,
    pub allocatable_cpu_millicores: i64,
    pub allocatable_memory_bytes: i64,
}

/// Abstract external container orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// List nodes as currently reported, unfiltered.
    async fn list_nodes(&self, node_role_label: &str, public_ip_label: &str) -> Result<Vec<ReportedNode>>;

    /// Create (or idempotently ensure) a durable volume for a server.
    async fn ensure_volume(&self, server_id: &str, volume_name: &str, size_bytes: i64) -> Result<()>;

    /// Delete a durable volume. Idempotent: deleting an absent volume is success.
    async fn delete_volume(&self, server_id: &str) -> Result<()>;

    /// Create (or replace) the workload described by `spec`.
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<()>;

    /// Scale a workload's replica count (fire-and-forget stop uses 0).
    async fn scale_workload(&self, server_id: &str, replicas: u32) -> Result<()>;

    /// Delete a workload. Idempotent.
    async fn delete_workload(&self, server_id: &str) -> Result<()>;

    /// Current status of a workload.
    async fn workload_status(&self, server_id: &str) -> Result<WorkloadStatus>;

    /// Tail and follow a workload's logs until the returned stream is dropped.
    async fn stream_logs(&self, server_id: &str, follow: bool) -> Result<BoxStream<'static, Result<String>>>;

    /// Fetch a named document from the orchestrator's config store (used to
    /// load `games.yaml`, see `crate::catalog`).
    async fn get_config_document(&self, namespace: &str, document_name: &str) -> Result<serde_json::Value>;

    /// List the ids of every workload the orchestrator currently knows
    /// about, regardless of which (if any) Server it belongs to. Used by
    /// the Reconciler to find and reap orphaned workloads (§4.6).
    async fn list_workloads(&self) -> Result<Vec<String>>;
}

/// HTTP-client-backed [`Orchestrator`] speaking a Nomad-shaped API.
#[derive(Clone)]
pub struct NomadOrchestrator {
    client: Client,
    base_url: String,
    token: Option<String>,
    namespace: String,
    breaker: std::sync::Arc<CircuitBreaker>,
    retry: std::sync::Arc<RetryPolicy>,
}

impl NomadOrchestrator {
    pub fn new(base_url: impl Into<String>, namespace: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoreError::orchestrator(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            namespace: namespace.into(),
            breaker: std::sync::Arc::new(CircuitBreaker::with_defaults("orchestrator")),
            retry: std::sync::Arc::new(RetryPolicy::new(RetryConfig::default().max_retries(2))),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}?namespace={}", self.base_url, path, self.namespace)
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("X-Nomad-Token", token),
            None => req,
        }
    }

    /// Run a single outbound call through the circuit breaker, retrying
    /// transient failures with backoff while the circuit stays closed.
    async fn guarded<F, Fut, T>(&self, mut make_call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.retry
            .execute_if(
                || async {
                    self.breaker.call(make_call()).await.map_err(|e| match e {
                        CircuitBreakerError::Open => CoreError::transient("orchestrator circuit breaker open"),
                        CircuitBreakerError::ServiceError(inner) => inner,
                    })
                },
                |e: &CoreError| e.retriable(),
            )
            .await
    }
}

#[async_trait]
impl Orchestrator for NomadOrchestrator {
    #[instrument(skip(self))]
    async fn list_nodes(&self, node_role_label: &str, public_ip_label: &str) -> Result<Vec<ReportedNode>> {
        let stubs: Vec<NomadNodeStub> = self
            .guarded(|| async {
                let resp = self
                    .add_auth(self.client.get(format!("{}/v1/nodes", self.base_url)))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(resp.json().await?)
            })
            .await?;

        Ok(stubs.into_iter().map(|n| reported_node_from_stub(n, node_role_label, public_ip_label)).collect())
    }

    async fn ensure_volume(&self, server_id: &str, volume_name: &str, size_bytes: i64) -> Result<()> {
        let payload = serde_json::json!({
            "Name": format!("{}-{}", server_id, volume_name),
            "Namespace": self.namespace,
            "RequestedCapacityMax": size_bytes,
        });
        self.guarded(|| async {
            self.add_auth(self.client.put(self.url("/volumes/csi")))
                .json(&payload)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }

    async fn delete_volume(&self, server_id: &str) -> Result<()> {
        self.guarded(|| async {
            let resp = self
                .add_auth(self.client.delete(self.url(&format!("/volume/csi/{server_id}"))))
                .send()
                .await?;
            if resp.status() != reqwest::StatusCode::NOT_FOUND {
                resp.error_for_status()?;
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, spec))]
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        let job = NomadishJob {
            id: spec.server_id.clone(),
            datacenters: vec!["dc1".to_string()],
            constraint_node: spec.node.0.clone(),
            image: spec.image.clone(),
            env: spec.env.clone(),
            ports: spec.ports.iter().map(|(n, p, proto)| (n.clone(), *p, proto.to_string())).collect(),
            volume_name: spec.volume_name.clone(),
            mount_path: spec.mount_path.clone(),
        };
        let payload = serde_json::json!({ "Job": job, "EnforceIndex": false, "PolicyOverride": false });
        self.guarded(|| async {
            self.add_auth(self.client.post(self.url("/jobs")))
                .json(&payload)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await?;
        info!(server_id = %spec.server_id, node = %spec.node, "workload created");
        Ok(())
    }

    async fn scale_workload(&self, server_id: &str, replicas: u32) -> Result<()> {
        let payload = serde_json::json!({
            "Count": replicas,
            "Target": { "Group": "gameserver" },
            "PolicyOverride": false,
        });
        self.guarded(|| async {
            self.add_auth(self.client.post(self.url(&format!("/job/{server_id}/scale"))))
                .json(&payload)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }

    async fn delete_workload(&self, server_id: &str) -> Result<()> {
        self.guarded(|| async {
            let resp = self
                .add_auth(self.client.delete(self.url(&format!("/job/{server_id}"))))
                .send()
                .await?;
            if resp.status() != reqwest::StatusCode::NOT_FOUND {
                resp.error_for_status()?;
            }
            Ok(())
        })
        .await
    }

    async fn workload_status(&self, server_id: &str) -> Result<WorkloadStatus> {
        self.guarded(|| async {
            let resp = self
                .add_auth(self.client.get(self.url(&format!("/job/{server_id}"))))
                .send()
                .await?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(WorkloadStatus { exists: false, ready: false, replicas: 0 });
            }
            let resp = resp.error_for_status()?;
            let stub: NomadJobStatusStub = resp.json().await?;
            Ok(WorkloadStatus {
                exists: true,
                ready: stub.status == "running",
                replicas: stub.task_groups.first().map(|g| g.count).unwrap_or(0),
            })
        })
        .await
    }

    async fn stream_logs(&self, server_id: &str, follow: bool) -> Result<BoxStream<'static, Result<String>>> {
        use futures::StreamExt;

        let url = format!(
            "{}&follow={}&type=stdout",
            self.url(&format!("/client/fs/logs/{server_id}")),
            follow
        );
        let resp = self.add_auth(self.client.get(url)).send().await?.error_for_status()?;

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| String::from_utf8_lossy(&b).into_owned()).map_err(CoreError::from));
        Ok(Box::pin(stream))
    }

    async fn get_config_document(&self, namespace: &str, document_name: &str) -> Result<serde_json::Value> {
        let url = format!(
            "{}/v1/var/{}/{}?namespace={}",
            self.base_url, namespace, document_name, namespace
        );
        let resp = self.add_auth(self.client.get(url)).send().await?.error_for_status()?;
        let doc: serde_json::Value = resp.json().await?;
        Ok(doc)
    }

    #[instrument(skip(self))]
    async fn list_workloads(&self) -> Result<Vec<String>> {
        let stubs: Vec<NomadJobStub> = self
            .guarded(|| async {
                let resp = self
                    .add_auth(self.client.get(self.url("/jobs")))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(resp.json().await?)
            })
            .await?;
        Ok(stubs.into_iter().map(|j| j.id).collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NomadNodeStub {
    name: String,
    status: String,
    drain: bool,
    node_class: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, String>,
    resources: Option<NomadNodeResources>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NomadNodeResources {
    #[serde(rename = "CPU")]
    cpu: Option<i32>,
    #[serde(rename = "MemoryMB")]
    memory_mb: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NomadJobStatusStub {
    status: String,
    #[serde(default)]
    task_groups: Vec<NomadTaskGroupStatusStub>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NomadTaskGroupStatusStub {
    count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NomadJobStub {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct NomadishJob {
    #[serde(rename = "ID")]
    id: String,
    datacenters: Vec<String>,
    constraint_node: String,
    image: String,
    env: HashMap<String, String>,
    ports: Vec<(String, u16, String)>,
    volume_name: String,
    mount_path: String,
}

fn reported_node_from_stub(n: NomadNodeStub, node_role_label: &str, public_ip_label: &str) -> ReportedNode {
    let has_gameserver_role = n.node_class.as_deref().map(|c| c == node_role_label).unwrap_or(false);
    let public_ip = n.attributes.get(public_ip_label).cloned();
    ReportedNode {
        name: NodeName::from(n.name),
        public_ip,
        ready: n.status == "ready" && !n.drain,
        has_gameserver_role,
        allocatable_cpu_millicores: n.resources.as_ref().and_then(|r| r.cpu).unwrap_or(0) as i64,
        allocatable_memory_bytes: n
            .resources
            .as_ref()
            .and_then(|r| r.memory_mb)
            .map(|mb| mb as i64 * 1024 * 1024)
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(node_class: Option<&str>, status: &str, drain: bool) -> NomadNodeStub {
        NomadNodeStub {
            name: "node-1".to_string(),
            status: status.to_string(),
            drain,
            node_class: node_class.map(String::from),
            attributes: HashMap::from([("unique.network.ip-address".to_string(), "203.0.113.5".to_string())]),
            resources: Some(NomadNodeResources { cpu: Some(4000), memory_mb: Some(8192) }),
        }
    }

    #[test]
    fn reported_node_carries_gameserver_role_and_readiness() {
        let node = reported_node_from_stub(stub(Some("gameserver"), "ready", false), "gameserver", "unique.network.ip-address");
        assert!(node.has_gameserver_role);
        assert!(node.ready);
        assert_eq!(node.public_ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(node.allocatable_cpu_millicores, 4000);
        assert_eq!(node.allocatable_memory_bytes, 8192 * 1024 * 1024);
    }

    #[test]
    fn draining_node_is_not_ready_even_if_status_is_ready() {
        let node = reported_node_from_stub(stub(Some("gameserver"), "ready", true), "gameserver", "unique.network.ip-address");
        assert!(!node.ready);
    }

    #[test]
    fn node_without_matching_class_lacks_gameserver_role() {
        let node = reported_node_from_stub(stub(Some("other"), "ready", false), "gameserver", "unique.network.ip-address");
        assert!(!node.has_gameserver_role);
    }

    #[tokio::test]
    async fn guarded_retries_transient_errors_and_succeeds() {
        let orchestrator = NomadOrchestrator::new("http://127.0.0.1:0", "default", None).unwrap();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = orchestrator
            .guarded(|| {
                let attempts = &attempts;
                async move {
                    if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 1 {
                        Err(CoreError::transient("simulated transient failure"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn guarded_does_not_retry_terminal_errors() {
        let orchestrator = NomadOrchestrator::new("http://127.0.0.1:0", "default", None).unwrap();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<i32> = orchestrator
            .guarded(|| {
                let attempts = &attempts;
                async move {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(CoreError::validation("bad request"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
