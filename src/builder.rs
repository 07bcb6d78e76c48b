//! ControlPlaneBuilder for constructing a [`ControlPlane`] (§0)
//!
//! ## Table of Contents
//! - **ControlPlaneBuilder**: wires every component from a [`Config`]

use crate::allocator::Allocator;
use crate::billing::{BillingBridge, PaymentGateway, StripeLikeGateway};
use crate::catalog::GameCatalog;
use crate::config::Config;
use crate::error::Result;
use crate::hub::Hub;
use crate::lifecycle::Lifecycle;
use crate::metrics::CoreMetrics;
use crate::nodesync::NodeSync;
use crate::orchestrator::{NomadOrchestrator, Orchestrator};
use crate::reconciler::Reconciler;
use crate::runtime::ControlPlane;
use crate::store::{PgStore, Store};
use crate::supervisor_gateway::SupervisorGateway;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Builds a [`ControlPlane`] from a [`Config`], defaulting every collaborator
/// to its production implementation; tests substitute fakes via
/// `with_store`/`with_orchestrator`/`with_payment_gateway`.
pub struct ControlPlaneBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    payment_gateway: Option<Arc<dyn PaymentGateway>>,
}

impl ControlPlaneBuilder {
    pub fn new(config: Config) -> Self {
        Self { config, store: None, orchestrator: None, payment_gateway: None }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_payment_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.payment_gateway = Some(gateway);
        self
    }

    /// Construct every component and load the game catalog. Connects to
    /// Postgres and runs migrations if no store was injected.
    pub async fn build(self) -> Result<ControlPlane> {
        info!(http_addr = %self.config.http_addr, "building control plane");

        let store: Arc<dyn Store> = match self.store {
            Some(s) => s,
            None => Arc::new(PgStore::connect(&self.config.db_url).await?),
        };

        let orchestrator: Arc<dyn Orchestrator> = match self.orchestrator {
            Some(o) => o,
            None => Arc::new(NomadOrchestrator::new(
                self.config.orch_api.clone(),
                self.config.orch_namespace.clone(),
                self.config.orch_token.clone(),
            )?),
        };

        let payment_gateway: Arc<dyn PaymentGateway> = match self.payment_gateway {
            Some(g) => g,
            None => Arc::new(StripeLikeGateway::new(self.config.payment_webhook_secret.clone())),
        };

        let catalog = Arc::new(
            GameCatalog::load(&orchestrator, &self.config.orch_namespace, &self.config.orch_game_catalog_name).await?,
        );

        let hub = Arc::new(Hub::new());
        let allocator = Arc::new(Allocator::new(store.clone(), self.config.overhead_factor));
        let metrics = Arc::new(CoreMetrics::new()?);

        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            orchestrator.clone(),
            allocator.clone(),
            catalog.clone(),
            hub.clone(),
            Duration::from_secs(self.config.grace_period_secs),
        ));

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            orchestrator.clone(),
            lifecycle.clone(),
            Duration::from_secs(self.config.reconcile_interval_secs),
            Duration::from_secs(self.config.cleanup_interval_secs),
            Duration::from_secs(self.config.stop_fallback_delay_secs),
        ));

        let node_sync = Arc::new(NodeSync::new(
            store.clone(),
            orchestrator.clone(),
            self.config.node_role_label.clone(),
            self.config.public_ip_label.clone(),
            self.config.port_range_min,
            self.config.port_range_max,
            Duration::from_secs(self.config.nodesync_interval_secs),
        ));

        let billing = Arc::new(BillingBridge::new(store.clone(), lifecycle.clone(), payment_gateway));
        let supervisor_gateway = Arc::new(SupervisorGateway::new(store.clone(), hub.clone()));

        Ok(ControlPlane::new(
            self.config,
            store,
            orchestrator,
            catalog,
            hub,
            allocator,
            lifecycle,
            reconciler,
            node_sync,
            billing,
            supervisor_gateway,
            metrics,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::WebhookEvent;
    use crate::orchestrator::{ReportedNode, WorkloadSpec, WorkloadStatus};
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    struct FakeOrchestrator;

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn list_nodes(&self, _: &str, _: &str) -> Result<Vec<ReportedNode>> {
            Ok(vec![])
        }
        async fn ensure_volume(&self, _: &str, _: &str, _: i64) -> Result<()> {
            Ok(())
        }
        async fn delete_volume(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn create_workload(&self, _: &WorkloadSpec) -> Result<()> {
            Ok(())
        }
        async fn scale_workload(&self, _: &str, _: u32) -> Result<()> {
            Ok(())
        }
        async fn delete_workload(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn workload_status(&self, _: &str) -> Result<WorkloadStatus> {
            Ok(WorkloadStatus { exists: false, ready: false, replicas: 0 })
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

    struct FakeGateway;

    impl PaymentGateway for FakeGateway {
        fn verify_and_parse(&self, _payload: &[u8], _signature_header: &str) -> Result<WebhookEvent> {
            Err(crate::error::CoreError::authorization("not used in this test"))
        }

        fn create_checkout_session(
            &self,
            _price_id: &str,
            _metadata: &std::collections::HashMap<String, String>,
        ) -> Result<crate::billing::CheckoutSession> {
            Err(crate::error::CoreError::authorization("not used in this test"))
        }
    }

    #[tokio::test]
    async fn builder_wires_every_component_with_injected_collaborators() {
        let config = Config { db_url: "unused".into(), payment_webhook_secret: "whsec".into(), ..Config::default() };
        let plane = ControlPlaneBuilder::new(config)
            .with_store(Arc::new(MemoryStore::new()))
            .with_orchestrator(Arc::new(FakeOrchestrator))
            .with_payment_gateway(Arc::new(FakeGateway))
            .build()
            .await
            .unwrap();

        assert_eq!(plane.store().list_all_servers().await.unwrap().len(), 0);
    }
}
