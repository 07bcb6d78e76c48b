//! ControlPlane runtime (§0): the assembled process
//!
//! ## Table of Contents
//! - **ControlPlane**: owns every component and drives the background loops
//!   (NodeSync, Reconciler) plus the core-relevant HTTP surface (§11)

use crate::allocator::Allocator;
use crate::billing::BillingBridge;
use crate::catalog::GameCatalog;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::hub::Hub;
use crate::lifecycle::Lifecycle;
use crate::metrics::CoreMetrics;
use crate::nodesync::NodeSync;
use crate::orchestrator::Orchestrator;
use crate::reconciler::Reconciler;
use crate::store::Store;
use crate::supervisor_gateway::SupervisorGateway;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// The assembled control plane: every component plus the background loops
/// and HTTP surface that drive them.
pub struct ControlPlane {
    config: Config,
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    catalog: Arc<GameCatalog>,
    hub: Arc<Hub>,
    allocator: Arc<Allocator>,
    lifecycle: Arc<Lifecycle>,
    reconciler: Arc<Reconciler>,
    node_sync: Arc<NodeSync>,
    billing: Arc<BillingBridge>,
    supervisor_gateway: Arc<SupervisorGateway>,
    metrics: Arc<CoreMetrics>,
}

impl ControlPlane {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Config,
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        catalog: Arc<GameCatalog>,
        hub: Arc<Hub>,
        allocator: Arc<Allocator>,
        lifecycle: Arc<Lifecycle>,
        reconciler: Arc<Reconciler>,
        node_sync: Arc<NodeSync>,
        billing: Arc<BillingBridge>,
        supervisor_gateway: Arc<SupervisorGateway>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            config,
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
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    pub fn catalog(&self) -> &Arc<GameCatalog> {
        &self.catalog
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn billing(&self) -> &Arc<BillingBridge> {
        &self.billing
    }

    pub fn supervisor_gateway(&self) -> &Arc<SupervisorGateway> {
        &self.supervisor_gateway
    }

    pub fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.metrics
    }

    /// Run the control plane until ctrl-c: starts NodeSync and Reconciler as
    /// background tasks, serves the core-relevant HTTP surface (§11) in the
    /// foreground, and signals every background task to stop once the HTTP
    /// server returns.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let node_sync = self.node_sync.clone();
        let node_sync_shutdown = shutdown_rx.clone();
        let node_sync_task = tokio::spawn(async move { node_sync.run(node_sync_shutdown).await });

        let reconciler = self.reconciler.clone();
        let reconciler_shutdown = shutdown_rx.clone();
        let reconciler_task = tokio::spawn(async move { reconciler.run(reconciler_shutdown).await });

        let router = crate::http::build_router(self.clone());
        let listener = tokio::net::TcpListener::bind(&self.config.http_addr)
            .await
            .map_err(|e| CoreError::internal(format!("failed to bind {}: {e}", self.config.http_addr)))?;

        info!(addr = %self.config.http_addr, "control plane HTTP surface listening");

        tokio::select! {
            result = axum::serve(listener, router) => {
                if let Err(e) = result {
                    warn!(error = %e, "HTTP server exited with an error");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
            }
        }

        let _ = shutdown_tx.send(true);
        let _ = tokio::join!(node_sync_task, reconciler_task);
        info!("control plane stopped");
        Ok(())
    }
}
