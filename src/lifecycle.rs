//! Lifecycle (C5): the server state machine (§4.5)
//!
//! Every state change goes through `Store::transition_server_status`; a
//! `false` return means "state changed underneath me" and the caller bails
//! out without side-effects (§4.5, §5). This module owns the side-effects
//! attached to each transition and the Hub publication that follows every
//! successful one.

use crate::allocator::Allocator;
use crate::catalog::{merge_env_vars, GameCatalog};
use crate::error::{CoreError, Result};
use crate::hub::{Hub, StatusEvent};
use crate::orchestrator::{Orchestrator, WorkloadSpec};
use crate::store::models::Server;
use crate::store::Store;
use crate::types::{NodeName, ServerId, ServerStatus, UserId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// The server state machine: validates transitions and performs their
/// side-effects.
pub struct Lifecycle {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    allocator: Arc<Allocator>,
    catalog: Arc<GameCatalog>,
    hub: Arc<Hub>,
    grace_period: chrono::Duration,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        allocator: Arc<Allocator>,
        catalog: Arc<GameCatalog>,
        hub: Arc<Hub>,
        grace_period: std::time::Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            allocator,
            catalog,
            hub,
            grace_period: chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::days(7)),
        }
    }

    async fn publish(&self, server: &Server) {
        self.hub.publish(
            server.user_id,
            StatusEvent {
                server_id: server.id,
                status: server.status,
                status_message: server.status_message.clone(),
                timestamp: Utc::now(),
            },
        );
    }

    /// pending -> starting: allocate, ensure volume, create workload.
    #[instrument(skip(self))]
    pub async fn start_workload(&self, server_id: ServerId) -> Result<()> {
        let Some(server) = self.store.get_server(server_id).await? else {
            return Err(CoreError::authorization("server not found"));
        };
        if server.status != ServerStatus::Pending {
            return Ok(());
        }

        let game = match self.catalog.game(&server.game) {
            Ok(g) => g,
            Err(e) => return self.fail(server_id, &e.to_string()).await,
        };
        let plan = match game.plan(&server.plan) {
            Ok(p) => p,
            Err(e) => return self.fail(server_id, &e.to_string()).await,
        };

        let requirements = game.port_requirements();
        let allocation = match self.allocator.allocate(server_id, &requirements, plan.resource_requirement()).await {
            Ok(a) => a,
            Err(e) if e.retriable() => {
                warn!(server_id = %server_id, error = %e, "allocation failed, retrying next tick");
                return Ok(());
            }
            Err(e) => return self.fail(server_id, &e.to_string()).await,
        };

        let volume_name = game.volumes.first().map(|v| v.volume_name.clone()).unwrap_or_else(|| "data".to_string());
        let mount_path = game.volumes.first().map(|v| v.mount_path.clone()).unwrap_or_else(|| "/data".to_string());

        if let Err(e) = self
            .orchestrator
            .ensure_volume(&server_id.to_string(), &volume_name, plan.storage_bytes)
            .await
        {
            self.allocator.release(server_id).await?;
            if e.retriable() {
                warn!(server_id = %server_id, error = %e, "volume provisioning failed, retrying next tick");
                return Ok(());
            }
            return self.fail(server_id, &e.to_string()).await;
        }

        let env = merge_env_vars(&game.env, &plan.env, server.env_overrides_map().as_ref());
        let spec = WorkloadSpec {
            server_id: server_id.to_string(),
            node: NodeName::from(allocation.node.name.clone()),
            image: game.supervisor_image.clone(),
            env,
            ports: allocation.ports.iter().map(|p| (p.port_name.clone(), p.port as u16, p.protocol)).collect(),
            volume_name,
            mount_path,
        };

        if let Err(e) = self.orchestrator.create_workload(&spec).await {
            self.allocator.release(server_id).await?;
            if e.retriable() {
                warn!(server_id = %server_id, error = %e, "workload creation failed, retrying next tick");
                return Ok(());
            }
            return self.fail(server_id, &e.to_string()).await;
        }

        let transitioned = self
            .store
            .transition_server_status(server_id, &[ServerStatus::Pending], ServerStatus::Starting, None)
            .await?;
        if transitioned {
            if let Some(server) = self.store.get_server(server_id).await? {
                self.publish(&server).await;
            }
        }
        Ok(())
    }

    /// starting -> running, driven by the supervisor or a reconciler Ready check.
    pub async fn confirm_running(&self, server_id: ServerId) -> Result<bool> {
        self.apply_transition(server_id, &[ServerStatus::Starting], ServerStatus::Running, None).await
    }

    /// {running,starting,pending} -> stopping: user-initiated stop.
    #[instrument(skip(self))]
    pub async fn stop(&self, server_id: ServerId, requesting_user: UserId) -> Result<()> {
        let Some(server) = self.store.get_server(server_id).await? else {
            return Err(CoreError::authorization("server not found"));
        };
        if server.user_id != requesting_user {
            return Err(CoreError::authorization("server not owned by caller"));
        }

        let transitioned = self
            .apply_transition(server_id, ServerStatus::stoppable_from(), ServerStatus::Stopping, None)
            .await?;
        if !transitioned {
            return Ok(());
        }

        // fire-and-forget: scale to zero, the reconciler's fallback confirms later
        if let Err(e) = self.orchestrator.scale_workload(&server_id.to_string(), 0).await {
            warn!(server_id = %server_id, error = %e, "scale-to-zero request failed, reconciler will retry");
        }
        Ok(())
    }

    /// stopping -> stopped, confirmed by supervisor report or reconciler fallback.
    pub async fn confirm_stopped(&self, server_id: ServerId, message: Option<&str>) -> Result<bool> {
        self.apply_transition(server_id, &[ServerStatus::Stopping], ServerStatus::Stopped, message).await
    }

    /// {stopped,failed} -> pending: user-initiated (re)start.
    #[instrument(skip(self))]
    pub async fn start(&self, server_id: ServerId, requesting_user: UserId) -> Result<()> {
        let Some(server) = self.store.get_server(server_id).await? else {
            return Err(CoreError::authorization("server not found"));
        };
        if server.user_id != requesting_user {
            return Err(CoreError::authorization("server not owned by caller"));
        }
        self.apply_transition(server_id, &[ServerStatus::Stopped, ServerStatus::Failed], ServerStatus::Pending, None)
            .await?;
        Ok(())
    }

    /// {running,starting,stopped,failed} -> pending: user-initiated restart.
    /// Releases the current reservation so the reconciler allocates fresh
    /// ports when it recreates the workload (§9: release-then-reallocate).
    #[instrument(skip(self))]
    pub async fn restart(&self, server_id: ServerId, requesting_user: UserId) -> Result<()> {
        let Some(server) = self.store.get_server(server_id).await? else {
            return Err(CoreError::authorization("server not found"));
        };
        if server.user_id != requesting_user {
            return Err(CoreError::authorization("server not owned by caller"));
        }

        let transitioned = self
            .apply_transition(server_id, ServerStatus::restartable_from(), ServerStatus::Pending, Some("Restart requested"))
            .await?;
        if !transitioned {
            return Ok(());
        }

        if let Err(e) = self.orchestrator.delete_workload(&server_id.to_string()).await {
            warn!(server_id = %server_id, error = %e, "workload delete failed during restart, recreate proceeds regardless");
        }
        self.allocator.release(server_id).await?;
        Ok(())
    }

    /// any eligible -> expired: subscription cancelled.
    #[instrument(skip(self))]
    pub async fn expire(&self, server_id: ServerId, message: &str) -> Result<bool> {
        let transitioned = self
            .apply_transition(server_id, ServerStatus::expirable_from(), ServerStatus::Expired, Some(message))
            .await?;
        if !transitioned {
            return Ok(false);
        }

        if let Err(e) = self.orchestrator.delete_workload(&server_id.to_string()).await {
            warn!(server_id = %server_id, error = %e, "workload delete failed during expiry, will retry via reconciler");
        }
        self.allocator.release(server_id).await?;
        self.store.set_delete_after(server_id, Some(Utc::now() + self.grace_period)).await?;
        Ok(true)
    }

    /// expired -> deleting -> deleted (or revert to expired on failure), §4.6 step 5.
    #[instrument(skip(self))]
    pub async fn run_cleanup(&self, server_id: ServerId) -> Result<()> {
        let transitioned = self
            .apply_transition(server_id, &[ServerStatus::Expired], ServerStatus::Deleting, None)
            .await?;
        if !transitioned {
            return Ok(());
        }

        match self.orchestrator.delete_volume(&server_id.to_string()).await {
            Ok(()) => {
                self.apply_transition(server_id, &[ServerStatus::Deleting], ServerStatus::Deleted, None).await?;
                self.store.hard_delete_server(server_id).await?;
            }
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "volume delete failed, reverting to expired for retry");
                self.apply_transition(server_id, &[ServerStatus::Deleting], ServerStatus::Expired, None).await?;
            }
        }
        Ok(())
    }

    /// any -> failed: unrecoverable creation error (§4.5, §7 class 6).
    async fn fail(&self, server_id: ServerId, message: &str) -> Result<()> {
        self.store.set_creation_error(server_id, message).await?;
        let all_states = ServerStatus::ALL;
        self.apply_transition(server_id, &all_states, ServerStatus::Failed, Some(message)).await?;
        Ok(())
    }

    /// Apply a conditional transition and, if it succeeded, publish the
    /// resulting `StatusEvent` to the Hub.
    async fn apply_transition(
        &self,
        server_id: ServerId,
        from: &[ServerStatus],
        to: ServerStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let transitioned = self.store.transition_server_status(server_id, from, to, message).await?;
        if transitioned {
            info!(server_id = %server_id, ?to, "server transitioned");
            if let Some(server) = self.store.get_server(server_id).await? {
                self.publish(&server).await;
            }
        }
        Ok(transitioned)
    }

    /// Apply a user-supplied env override (§6 `PUT /servers/:id/env`); only
    /// takes effect the next time the workload is (re)created.
    pub async fn set_env(
        &self,
        server_id: ServerId,
        requesting_user: UserId,
        overrides: Option<HashMap<String, String>>,
    ) -> Result<()> {
        if let Some(ref overrides) = overrides {
            crate::catalog::validate_env_overrides(overrides)?;
        }
        let Some(server) = self.store.get_server(server_id).await? else {
            return Err(CoreError::authorization("server not found"));
        };
        if server.user_id != requesting_user {
            return Err(CoreError::authorization("server not owned by caller"));
        }
        self.store.set_server_env_overrides(server_id, overrides).await
    }
}

/// Generate a fresh, random supervisor auth token (§3, §4.9).
pub fn generate_auth_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{GameConfig, PlanConfig, PortDescriptor};
    use crate::orchestrator::{ReportedNode, WorkloadStatus};
    use crate::store::memory::MemoryStore;
    use crate::types::Protocol;
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
            Ok(WorkloadStatus { exists: true, ready: true, replicas: 1 })
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

    /// An orchestrator whose `ensure_volume`/`create_workload` always fail,
    /// either with a retriable (transient) or terminal (catalog) error, to
    /// exercise the branching in `start_workload`.
    struct FlakyOrchestrator {
        retriable: bool,
    }

    impl FlakyOrchestrator {
        fn error(&self) -> CoreError {
            if self.retriable {
                CoreError::transient("orchestrator temporarily unavailable")
            } else {
                CoreError::catalog("unknown game image")
            }
        }
    }

    #[async_trait]
    impl Orchestrator for FlakyOrchestrator {
        async fn list_nodes(&self, _: &str, _: &str) -> Result<Vec<ReportedNode>> {
            Ok(vec![])
        }
        async fn ensure_volume(&self, _: &str, _: &str, _: i64) -> Result<()> {
            Err(self.error())
        }
        async fn delete_volume(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn create_workload(&self, _: &WorkloadSpec) -> Result<()> {
            Err(self.error())
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

    fn test_catalog() -> GameCatalog {
        let mut plans = HashMap::new();
        plans.insert(
            "small".to_string(),
            PlanConfig { cpu_millicores: 500, memory_bytes: 512_000_000, storage_bytes: 1_000_000_000, env: HashMap::new() },
        );
        GameCatalog::from_games(vec![GameConfig {
            name: "minecraft".to_string(),
            supervisor_image: "img:latest".to_string(),
            ports: vec![PortDescriptor { port_name: "game".into(), container_port: 25565, protocol: Protocol::Tcp }],
            volumes: vec![],
            env: HashMap::new(),
            health_check: None,
            process: None,
            plans,
        }])
    }

    async fn make_lifecycle() -> (Lifecycle, Arc<dyn Store>, ServerId, UserId) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let node = NodeName::from("n1");
        store.upsert_node(&node, "203.0.113.1", 4000, 8_000_000_000).await.unwrap();
        store.initialize_node_ports(&node, 25500, 25510).await.unwrap();

        let user = store.create_user("p@example.com", "hash").await.unwrap();
        let server = store
            .create_server(user.id, "My Server", "alpha", "minecraft", "small", Some("sub_1"), "tok")
            .await
            .unwrap();

        let orchestrator: Arc<dyn Orchestrator> = Arc::new(FakeOrchestrator);
        let allocator = Arc::new(Allocator::new(store.clone(), 0.90));
        let catalog = Arc::new(test_catalog());
        let hub = Arc::new(Hub::new());

        let lifecycle = Lifecycle::new(store.clone(), orchestrator, allocator, catalog, hub, std::time::Duration::from_secs(604800));
        (lifecycle, store, server.id, user.id)
    }

    async fn make_lifecycle_with_orchestrator(
        orchestrator: Arc<dyn Orchestrator>,
    ) -> (Lifecycle, Arc<dyn Store>, ServerId, UserId) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let node = NodeName::from("n1");
        store.upsert_node(&node, "203.0.113.1", 4000, 8_000_000_000).await.unwrap();
        store.initialize_node_ports(&node, 25500, 25510).await.unwrap();

        let user = store.create_user("p@example.com", "hash").await.unwrap();
        let server = store
            .create_server(user.id, "My Server", "alpha", "minecraft", "small", Some("sub_1"), "tok")
            .await
            .unwrap();

        let allocator = Arc::new(Allocator::new(store.clone(), 0.90));
        let catalog = Arc::new(test_catalog());
        let hub = Arc::new(Hub::new());

        let lifecycle = Lifecycle::new(store.clone(), orchestrator, allocator, catalog, hub, std::time::Duration::from_secs(604800));
        (lifecycle, store, server.id, user.id)
    }

    #[tokio::test]
    async fn pending_to_starting_allocates_and_transitions() {
        let (lifecycle, store, server_id, _user) = make_lifecycle().await;
        lifecycle.start_workload(server_id).await.unwrap();
        let server = store.get_server(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Starting);
        assert!(server.node_name.is_some());
    }

    #[tokio::test]
    async fn stop_rejects_non_owner() {
        let (lifecycle, _store, server_id, _user) = make_lifecycle().await;
        let err = lifecycle.stop(server_id, UserId::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));
    }

    #[tokio::test]
    async fn double_stop_is_idempotent_second_call_noop() {
        let (lifecycle, store, server_id, user) = make_lifecycle().await;
        lifecycle.start_workload(server_id).await.unwrap();
        lifecycle.confirm_running(server_id).await.unwrap();

        lifecycle.stop(server_id, user).await.unwrap();
        let after_first = store.get_server(server_id).await.unwrap().unwrap();
        assert_eq!(after_first.status, ServerStatus::Stopping);

        lifecycle.stop(server_id, user).await.unwrap();
        let after_second = store.get_server(server_id).await.unwrap().unwrap();
        assert_eq!(after_second.status, ServerStatus::Stopping);
    }

    #[tokio::test]
    async fn restart_releases_ports_and_goes_back_to_pending() {
        let (lifecycle, store, server_id, user) = make_lifecycle().await;
        lifecycle.start_workload(server_id).await.unwrap();
        lifecycle.confirm_running(server_id).await.unwrap();

        lifecycle.restart(server_id, user).await.unwrap();

        let server = store.get_server(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Pending);
        let details = store.get_server_with_details(server_id).await.unwrap().unwrap();
        assert!(details.ports.is_empty(), "restart should release the prior port reservation");
    }

    #[tokio::test]
    async fn expire_releases_ports_and_sets_delete_after() {
        let (lifecycle, store, server_id, _user) = make_lifecycle().await;
        lifecycle.start_workload(server_id).await.unwrap();

        let transitioned = lifecycle.expire(server_id, "Subscription cancelled").await.unwrap();
        assert!(transitioned);

        let server = store.get_server(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Expired);
        assert!(server.delete_after.is_some());

        let details = store.get_server_with_details(server_id).await.unwrap().unwrap();
        assert!(details.ports.is_empty(), "ports should be released on expiry");
    }

    #[tokio::test]
    async fn cleanup_hard_deletes_after_deleting() {
        let (lifecycle, store, server_id, _user) = make_lifecycle().await;
        lifecycle.start_workload(server_id).await.unwrap();
        lifecycle.expire(server_id, "Subscription cancelled").await.unwrap();

        lifecycle.run_cleanup(server_id).await.unwrap();
        assert!(store.get_server(server_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_orchestrator_error_leaves_server_pending_for_retry() {
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(FlakyOrchestrator { retriable: true });
        let (lifecycle, store, server_id, _user) = make_lifecycle_with_orchestrator(orchestrator).await;

        lifecycle.start_workload(server_id).await.unwrap();

        let server = store.get_server(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Pending, "a transient error must not fail the server");
        let details = store.get_server_with_details(server_id).await.unwrap().unwrap();
        assert!(details.ports.is_empty(), "the failed attempt's port reservation must be released");
    }

    #[tokio::test]
    async fn unrecoverable_orchestrator_error_fails_the_server() {
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(FlakyOrchestrator { retriable: false });
        let (lifecycle, store, server_id, _user) = make_lifecycle_with_orchestrator(orchestrator).await;

        lifecycle.start_workload(server_id).await.unwrap();

        let server = store.get_server(server_id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Failed);
    }
}
