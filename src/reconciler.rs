//! Reconciler (C6): drives every server toward its desired state (§4.6)
//!
//! A single periodic task, idempotent and safe to run on multiple replicas
//! concurrently — every mutation goes through the Lifecycle's conditional
//! transitions, so a duplicate tick wastes work rather than corrupting
//! state.

use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::orchestrator::Orchestrator;
use crate::store::Store;
use crate::types::{ServerId, ServerStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Periodic reconciliation + grace-period cleanup loop.
pub struct Reconciler {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    lifecycle: Arc<Lifecycle>,
    reconcile_interval: Duration,
    cleanup_interval: Duration,
    stop_fallback_delay: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        lifecycle: Arc<Lifecycle>,
        reconcile_interval: Duration,
        cleanup_interval: Duration,
        stop_fallback_delay: Duration,
    ) -> Self {
        Self { store, orchestrator, lifecycle, reconcile_interval, cleanup_interval, stop_fallback_delay }
    }

    /// One reconciliation sweep across every non-terminal server (§4.6 steps 1-4, 6).
    pub async fn reconcile_once(&self) -> Result<()> {
        self.reconcile_status(ServerStatus::Pending).await?;
        self.reconcile_status(ServerStatus::Starting).await?;
        self.reconcile_status(ServerStatus::Running).await?;
        self.reconcile_status(ServerStatus::Stopping).await?;
        self.reap_orphans().await?;
        Ok(())
    }

    async fn reconcile_status(&self, status: ServerStatus) -> Result<()> {
        for server in self.store.list_servers_by_status(status).await? {
            let result = match status {
                ServerStatus::Pending => self.lifecycle.start_workload(server.id).await,
                ServerStatus::Starting => self.reconcile_starting(server.id).await,
                ServerStatus::Running => self.reconcile_running(server.id).await,
                ServerStatus::Stopping => self.reconcile_stopping(server.id).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(server_id = %server.id, ?status, error = %e, "reconcile step failed, will retry next tick");
            }
            self.store.touch_reconciled(server.id).await?;
        }
        Ok(())
    }

    async fn reconcile_starting(&self, server_id: ServerId) -> Result<()> {
        let status = self.orchestrator.workload_status(&server_id.to_string()).await?;
        if status.exists && status.ready {
            self.lifecycle.confirm_running(server_id).await?;
        }
        Ok(())
    }

    async fn reconcile_running(&self, server_id: ServerId) -> Result<()> {
        let status = self.orchestrator.workload_status(&server_id.to_string()).await?;
        if !status.exists {
            warn!(server_id = %server_id, "running server's workload vanished, recreating via pending");
            self.store
                .transition_server_status(server_id, &[ServerStatus::Running], ServerStatus::Pending, Some("workload missing, recreating"))
                .await?;
        }
        Ok(())
    }

    async fn reconcile_stopping(&self, server_id: ServerId) -> Result<()> {
        let status = self.orchestrator.workload_status(&server_id.to_string()).await?;
        if !status.exists || status.replicas == 0 {
            self.lifecycle.confirm_stopped(server_id, None).await?;
        }
        Ok(())
    }

    /// Stop fallback (§4.5, §5): wait `stop_fallback_delay`, then force
    /// `stopping -> stopped` if the workload is at zero replicas.
    pub async fn run_stop_fallback(&self, server_id: ServerId) {
        tokio::time::sleep(self.stop_fallback_delay).await;
        match self.orchestrator.workload_status(&server_id.to_string()).await {
            Ok(status) if !status.exists || status.replicas == 0 => {
                if let Err(e) = self
                    .lifecycle
                    .confirm_stopped(server_id, Some("Server stopped (fallback)"))
                    .await
                {
                    warn!(server_id = %server_id, error = %e, "stop fallback failed");
                }
            }
            Ok(_) => {
                info!(server_id = %server_id, "stop fallback skipped, workload still has replicas");
            }
            Err(e) => warn!(server_id = %server_id, error = %e, "stop fallback status check failed"),
        }
    }

    /// Cleanup pass (§4.6 step 5): grace-expired servers move expired -> deleting -> deleted.
    pub async fn cleanup_once(&self) -> Result<()> {
        let now = chrono::Utc::now();
        for server in self.store.list_servers_by_status(ServerStatus::Expired).await? {
            if server.delete_after.map(|d| d <= now).unwrap_or(false) {
                if let Err(e) = self.lifecycle.run_cleanup(server.id).await {
                    warn!(server_id = %server.id, error = %e, "cleanup cycle failed, will retry next hour");
                }
            }
        }
        self.store.delete_expired_pending_requests().await?;
        Ok(())
    }

    /// Delete any workload the orchestrator reports that has no
    /// corresponding live Server (§4.6): a workload survives a crashed or
    /// interrupted create/delete sequence and would otherwise run forever.
    async fn reap_orphans(&self) -> Result<()> {
        let workload_ids = self.orchestrator.list_workloads().await?;
        if workload_ids.is_empty() {
            return Ok(());
        }

        let live_ids: std::collections::HashSet<String> = self
            .store
            .list_all_servers()
            .await?
            .into_iter()
            .filter(|s| !matches!(s.status, ServerStatus::Expired | ServerStatus::Deleting | ServerStatus::Deleted))
            .map(|s| s.id.to_string())
            .collect();

        for workload_id in workload_ids {
            if live_ids.contains(&workload_id) {
                continue;
            }
            warn!(workload_id = %workload_id, "deleting orphaned workload with no live server");
            if let Err(e) = self.orchestrator.delete_workload(&workload_id).await {
                warn!(workload_id = %workload_id, error = %e, "failed to delete orphaned workload, will retry next tick");
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut reconcile_ticker = tokio::time::interval(self.reconcile_interval);
        let mut cleanup_ticker = tokio::time::interval(self.cleanup_interval);

        loop {
            tokio::select! {
                _ = reconcile_ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "reconcile tick failed");
                    }
                }
                _ = cleanup_ticker.tick() => {
                    if let Err(e) = self.cleanup_once().await {
                        warn!(error = %e, "cleanup tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler shutting down");
                        return;
                    }
                }
            }
        }
    }
}
