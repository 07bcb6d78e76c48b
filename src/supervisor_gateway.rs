//! SupervisorGateway (C9): authenticated ingress for per-server reports (§4.9)
//!
//! The supervisor is part of the workload, external to this core, and
//! presents the server's `auth_token` as a bearer credential. Every
//! accepted report also publishes to the Hub.

use crate::error::{CoreError, Result};
use crate::hub::{Hub, StatusEvent};
use crate::store::Store;
use crate::types::{ServerId, ServerStatus};
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

/// Status values a supervisor may self-report (§4.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SupervisorStatus {
    fn as_server_status(self) -> ServerStatus {
        match self {
            SupervisorStatus::Starting => ServerStatus::Starting,
            SupervisorStatus::Running => ServerStatus::Running,
            SupervisorStatus::Stopping => ServerStatus::Stopping,
            SupervisorStatus::Stopped => ServerStatus::Stopped,
            SupervisorStatus::Failed => ServerStatus::Failed,
        }
    }
}

/// Bridges authenticated supervisor reports into the Store and Hub.
pub struct SupervisorGateway {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
}

impl SupervisorGateway {
    pub fn new(store: Arc<dyn Store>, hub: Arc<Hub>) -> Self {
        Self { store, hub }
    }

    async fn authenticate(&self, server_id: ServerId, token: &str) -> Result<crate::store::models::Server> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or_else(|| CoreError::authorization("unknown server"))?;
        if server.auth_token != token {
            return Err(CoreError::authorization("invalid supervisor token"));
        }
        Ok(server)
    }

    /// Status report: any-source transition is permitted here — the
    /// supervisor is the source of truth for the workload's own lifecycle
    /// (§4.9).
    #[instrument(skip(self, token))]
    pub async fn report_status(
        &self,
        server_id: ServerId,
        token: &str,
        status: SupervisorStatus,
        message: Option<&str>,
    ) -> Result<()> {
        self.authenticate(server_id, token).await?;

        let target = status.as_server_status();
        let transitioned = self
            .store
            .transition_server_status(server_id, &ServerStatus::ALL, target, message)
            .await?;

        if transitioned {
            if let Some(server) = self.store.get_server(server_id).await? {
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
        }
        Ok(())
    }

    /// Heartbeat report: updates `last_heartbeat` only (§4.9, §3 invariant 7).
    #[instrument(skip(self, token))]
    pub async fn report_heartbeat(&self, server_id: ServerId, token: &str) -> Result<()> {
        self.authenticate(server_id, token).await?;
        self.store.record_heartbeat(server_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn make_server() -> (Arc<dyn Store>, crate::types::ServerId, String) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let user = store.create_user("p@example.com", "hash").await.unwrap();
        let server = store
            .create_server(user.id, "My Server", "alpha", "minecraft", "small", None, "secret-token")
            .await
            .unwrap();
        (store, server.id, "secret-token".to_string())
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let (store, server_id, _token) = make_server().await;
        let gateway = SupervisorGateway::new(store, Arc::new(Hub::new()));
        let err = gateway
            .report_status(server_id, "wrong", SupervisorStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));
    }

    #[tokio::test]
    async fn valid_token_transitions_and_publishes() {
        let (store, server_id, token) = make_server().await;
        store
            .transition_server_status(server_id, &[ServerStatus::Pending], ServerStatus::Starting, None)
            .await
            .unwrap();

        let hub = Arc::new(Hub::new());
        let server = store.get_server(server_id).await.unwrap().unwrap();
        let mut handle = crate::hub::HubHandle::subscribe(hub.clone(), server.user_id);

        let gateway = SupervisorGateway::new(store.clone(), hub);
        gateway.report_status(server_id, &token, SupervisorStatus::Running, None).await.unwrap();

        let event = handle.receiver().recv().await.unwrap();
        assert_eq!(event.status, ServerStatus::Running);

        let updated = store.get_server(server_id).await.unwrap().unwrap();
        assert_eq!(updated.status, ServerStatus::Running);
    }

    #[tokio::test]
    async fn heartbeat_updates_last_heartbeat() {
        let (store, server_id, token) = make_server().await;
        let gateway = SupervisorGateway::new(store.clone(), Arc::new(Hub::new()));
        gateway.report_heartbeat(server_id, &token).await.unwrap();
        let server = store.get_server(server_id).await.unwrap().unwrap();
        assert!(server.last_heartbeat.is_some());
    }
}
