//! NodeSync (C2): periodic worker-node discovery (§4.2)

use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::store::Store;
use crate::types::NodeName;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Periodically discovers nodes from the Orchestrator and mirrors them into
/// the Store, with an initial immediate run before the first tick.
pub struct NodeSync {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    node_role_label: String,
    public_ip_label: String,
    port_range_min: u16,
    port_range_max: u16,
    interval: Duration,
}

impl NodeSync {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        node_role_label: String,
        public_ip_label: String,
        port_range_min: u16,
        port_range_max: u16,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            node_role_label,
            public_ip_label,
            port_range_min,
            port_range_max,
            interval,
        }
    }

    /// Run one discovery pass: upsert reported, eligible nodes and mark
    /// anything missing from the orchestrator's list inactive.
    pub async fn sync_once(&self) -> Result<()> {
        let reported = self
            .orchestrator
            .list_nodes(&self.node_role_label, &self.public_ip_label)
            .await?;

        let mut seen = Vec::with_capacity(reported.len());
        for node in reported {
            if !node.has_gameserver_role {
                continue;
            }
            let Some(public_ip) = node.public_ip else {
                warn!(node = %node.name, "eligible node missing public-ip label, skipping");
                continue;
            };

            self.store
                .upsert_node(&node.name, &public_ip, node.allocatable_cpu_millicores, node.allocatable_memory_bytes)
                .await?;
            self.store.set_node_active(&node.name, node.ready).await?;
            self.store
                .initialize_node_ports(&node.name, self.port_range_min, self.port_range_max)
                .await?;
            seen.push(node.name);
        }

        self.deactivate_missing(&seen).await?;
        info!(synced = seen.len(), "node sync pass complete");
        Ok(())
    }

    async fn deactivate_missing(&self, seen: &[NodeName]) -> Result<()> {
        for node in self.store.list_active_nodes().await? {
            let name = NodeName::from(node.name.clone());
            if !seen.contains(&name) {
                warn!(node = %name, "node missing from orchestrator report, marking inactive");
                self.store.set_node_active(&name, false).await?;
            }
        }
        Ok(())
    }

    /// Run the immediate pass, then tick forever at `self.interval` until
    /// `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.sync_once().await {
            warn!(error = %e, "initial node sync failed");
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(error = %e, "node sync tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("node sync shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ReportedNode;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    struct FakeOrchestrator {
        nodes: Vec<ReportedNode>,
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn list_nodes(&self, _role: &str, _ip: &str) -> Result<Vec<ReportedNode>> {
            Ok(self.nodes.clone())
        }
        async fn ensure_volume(&self, _: &str, _: &str, _: i64) -> Result<()> {
            Ok(())
        }
        async fn delete_volume(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn create_workload(&self, _: &crate::orchestrator::WorkloadSpec) -> Result<()> {
            Ok(())
        }
        async fn scale_workload(&self, _: &str, _: u32) -> Result<()> {
            Ok(())
        }
        async fn delete_workload(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn workload_status(&self, _: &str) -> Result<crate::orchestrator::WorkloadStatus> {
            Ok(crate::orchestrator::WorkloadStatus { exists: false, ready: false, replicas: 0 })
        }
        async fn stream_logs(&self, _: &str, _: bool) -> Result<BoxStream<'static, Result<String>>> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn get_config_document(&self, _: &str, _: &str) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "games": [] }))
        }
        async fn list_workloads(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    impl Clone for ReportedNode {
        fn clone(&self) -> Self {
            Self {
                name: self.name.clone(),
                public_ip: self.public_ip.clone(),
                ready: self.ready,
                has_gameserver_role: self.has_gameserver_role,
                allocatable_cpu_millicores: self.allocatable_cpu_millicores,
                allocatable_memory_bytes: self.allocatable_memory_bytes,
            }
        }
    }

    #[tokio::test]
    async fn eligible_node_is_upserted_and_activated() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(FakeOrchestrator {
            nodes: vec![ReportedNode {
                name: NodeName::from("node-1"),
                public_ip: Some("203.0.113.9".to_string()),
                ready: true,
                has_gameserver_role: true,
                allocatable_cpu_millicores: 4000,
                allocatable_memory_bytes: 8_000_000_000,
            }],
        });

        let sync = NodeSync::new(
            store.clone(),
            orchestrator,
            "gameserver".to_string(),
            "public-ip".to_string(),
            25500,
            25510,
            Duration::from_secs(300),
        );
        sync.sync_once().await.unwrap();

        let nodes = store.list_active_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "node-1");
    }

    #[tokio::test]
    async fn missing_node_is_deactivated_not_deleted() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.upsert_node(&NodeName::from("ghost"), "203.0.113.1", 1000, 1_000_000_000).await.unwrap();

        let orchestrator: Arc<dyn Orchestrator> = Arc::new(FakeOrchestrator { nodes: vec![] });
        let sync = NodeSync::new(
            store.clone(),
            orchestrator,
            "gameserver".to_string(),
            "public-ip".to_string(),
            25500,
            25510,
            Duration::from_secs(300),
        );
        sync.sync_once().await.unwrap();

        let nodes = store.list_active_nodes().await.unwrap();
        assert!(nodes.is_empty(), "ghost node should be inactive, not deleted");
    }
}
