//! In-memory [`Store`] fake, used by the rest of the crate's test suites.
//!
//! Mirrors the on-disk semantics closely enough (status CAS, port
//! reservation, webhook idempotency) that lifecycle/reconciler/billing tests
//! can run against it without a database.

use super::models::*;
use super::Store;
use crate::error::{CoreError, Result};
use crate::types::{NodeName, PendingRequestId, Protocol, ResourceRequirement, ServerId, ServerStatus, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    users_by_email: HashMap<String, UserId>,
    servers: HashMap<ServerId, Server>,
    nodes: HashMap<String, Node>,
    port_slots: Vec<PortSlot>,
    pending_requests: HashMap<PendingRequestId, PendingRequest>,
    billing_events: HashMap<String, BillingEvent>,
}

/// In-memory fake store (not durable; one process only).
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Sum of `reserved_cpu_millicores`/`reserved_memory_bytes` across servers
/// pinned to `node_name` that aren't terminal (invariant 4 / P2).
fn reserved_on_node(inner: &Inner, node_name: &str) -> (i64, i64) {
    inner
        .servers
        .values()
        .filter(|s| s.node_name.as_deref() == Some(node_name) && !s.status.excluded_from_capacity())
        .fold((0i64, 0i64), |(cpu, mem), s| (cpu + s.reserved_cpu_millicores, mem + s.reserved_memory_bytes))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, email: &str, password_hash: &str) -> Result<User> {
        let mut inner = self.inner.write();
        if inner.users_by_email.contains_key(email) {
            return Err(CoreError::validation(format!("email already registered: {email}")));
        }
        let now = Utc::now();
        let user = User {
            id: UserId::new(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            email_verified: false,
            billing_customer_handle: None,
            created_at: now,
            updated_at: now,
        };
        inner.users_by_email.insert(email.to_string(), user.id);
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let inner = self.inner.read();
        Ok(inner.users_by_email.get(email).and_then(|id| inner.users.get(id)).cloned())
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.inner.read().users.get(&id).cloned())
    }

    async fn mark_email_verified(&self, id: UserId) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(user) = inner.users.get_mut(&id) {
            user.email_verified = true;
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_user_password(&self, id: UserId, password_hash: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(user) = inner.users.get_mut(&id) {
            user.password_hash = password_hash.to_string();
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_billing_customer_handle(&self, id: UserId, handle: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(user) = inner.users.get_mut(&id) {
            user.billing_customer_handle = Some(handle.to_string());
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_server(
        &self,
        user_id: UserId,
        display_name: &str,
        subdomain: &str,
        game: &str,
        plan: &str,
        subscription_handle: Option<&str>,
        auth_token: &str,
    ) -> Result<Server> {
        let mut inner = self.inner.write();
        if inner.servers.values().any(|s| s.subdomain == subdomain) {
            return Err(CoreError::conflict(format!("subdomain already taken: {subdomain}")));
        }
        let now = Utc::now();
        let server = Server {
            id: ServerId::new(),
            user_id,
            display_name: display_name.to_string(),
            subdomain: subdomain.to_string(),
            game: game.to_string(),
            plan: plan.to_string(),
            status: ServerStatus::Pending,
            status_message: None,
            subscription_handle: subscription_handle.map(str::to_string),
            env_overrides: None,
            auth_token: auth_token.to_string(),
            last_heartbeat: None,
            node_name: None,
            reserved_cpu_millicores: 0,
            reserved_memory_bytes: 0,
            created_at: now,
            updated_at: now,
            stopped_at: None,
            expired_at: None,
            delete_after: None,
            last_reconciled: None,
            creation_error: None,
        };
        inner.servers.insert(server.id, server.clone());
        Ok(server)
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>> {
        Ok(self.inner.read().servers.get(&id).cloned())
    }

    async fn get_server_with_details(&self, id: ServerId) -> Result<Option<ServerWithDetails>> {
        let inner = self.inner.read();
        let Some(server) = inner.servers.get(&id).cloned() else {
            return Ok(None);
        };
        let ports = inner
            .port_slots
            .iter()
            .filter(|slot| slot.server_id == Some(id) && slot.allocated_at.is_some())
            .map(|slot| PortAllocation {
                node_name: slot.node_name.clone(),
                port: slot.port,
                protocol: slot.protocol,
                port_name: slot.port_name.clone().unwrap_or_default(),
                allocated_at: slot.allocated_at.unwrap(),
            })
            .collect();
        Ok(Some(ServerWithDetails { server, ports }))
    }

    async fn list_servers_by_user(&self, user_id: UserId) -> Result<Vec<Server>> {
        let mut servers: Vec<Server> = self
            .inner
            .read()
            .servers
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        servers.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(servers)
    }

    async fn list_all_servers(&self) -> Result<Vec<Server>> {
        let mut servers: Vec<Server> = self.inner.read().servers.values().cloned().collect();
        servers.sort_by_key(|s| s.created_at);
        Ok(servers)
    }

    async fn list_servers_by_status(&self, status: ServerStatus) -> Result<Vec<Server>> {
        let mut servers: Vec<Server> = self
            .inner
            .read()
            .servers
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        servers.sort_by_key(|s| s.created_at);
        Ok(servers)
    }

    async fn subdomain_exists(&self, subdomain: &str) -> Result<bool> {
        Ok(self.inner.read().servers.values().any(|s| s.subdomain == subdomain))
    }

    async fn get_server_by_subscription_handle(&self, handle: &str) -> Result<Option<Server>> {
        Ok(self
            .inner
            .read()
            .servers
            .values()
            .find(|s| s.subscription_handle.as_deref() == Some(handle))
            .cloned())
    }

    async fn transition_server_status(
        &self,
        id: ServerId,
        from: &[ServerStatus],
        to: ServerStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(server) = inner.servers.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&server.status) {
            return Ok(false);
        }
        server.status = to;
        server.status_message = message.map(str::to_string);
        server.updated_at = Utc::now();
        match to {
            ServerStatus::Stopped => server.stopped_at = Some(Utc::now()),
            ServerStatus::Expired => server.expired_at = Some(Utc::now()),
            _ => {}
        }
        Ok(true)
    }

    async fn set_server_env_overrides(&self, id: ServerId, overrides: Option<HashMap<String, String>>) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(server) = inner.servers.get_mut(&id) {
            server.env_overrides = overrides.map(|m| serde_json::to_value(m).unwrap());
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_heartbeat(&self, id: ServerId) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(server) = inner.servers.get_mut(&id) {
            server.last_heartbeat = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_creation_error(&self, id: ServerId, error: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(server) = inner.servers.get_mut(&id) {
            server.creation_error = Some(error.to_string());
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_delete_after(&self, id: ServerId, delete_after: Option<DateTime<Utc>>) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(server) = inner.servers.get_mut(&id) {
            server.delete_after = delete_after;
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn touch_reconciled(&self, id: ServerId) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(server) = inner.servers.get_mut(&id) {
            server.last_reconciled = Some(Utc::now());
        }
        Ok(())
    }

    async fn hard_delete_server(&self, id: ServerId) -> Result<()> {
        let mut inner = self.inner.write();
        inner.servers.remove(&id);
        for slot in inner.port_slots.iter_mut() {
            if slot.server_id == Some(id) {
                slot.server_id = None;
                slot.port_name = None;
                slot.allocated_at = None;
            }
        }
        Ok(())
    }

    async fn upsert_node(
        &self,
        name: &NodeName,
        public_ip: &str,
        allocatable_cpu_millicores: i64,
        allocatable_memory_bytes: i64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        inner
            .nodes
            .entry(name.0.clone())
            .and_modify(|n| {
                n.public_ip = public_ip.to_string();
                n.active = true;
                n.allocatable_cpu_millicores = allocatable_cpu_millicores;
                n.allocatable_memory_bytes = allocatable_memory_bytes;
                n.updated_at = now;
            })
            .or_insert(Node {
                name: name.0.clone(),
                public_ip: public_ip.to_string(),
                active: true,
                allocatable_cpu_millicores,
                allocatable_memory_bytes,
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn set_node_active(&self, name: &NodeName, active: bool) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(node) = inner.nodes.get_mut(&name.0) {
            node.active = active;
            node.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_active_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.inner.read().nodes.values().filter(|n| n.active).cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn initialize_node_ports(&self, node: &NodeName, min_port: u16, max_port: u16) -> Result<()> {
        let mut inner = self.inner.write();
        let existing: std::collections::HashSet<(String, i32, Protocol)> = inner
            .port_slots
            .iter()
            .map(|s| (s.node_name.clone(), s.port, s.protocol))
            .collect();
        for port in min_port..=max_port {
            for protocol in [Protocol::Tcp, Protocol::Udp] {
                let key = (node.0.clone(), port as i32, protocol);
                if !existing.contains(&key) {
                    inner.port_slots.push(PortSlot {
                        node_name: node.0.clone(),
                        port: port as i32,
                        protocol,
                        server_id: None,
                        port_name: None,
                        allocated_at: None,
                    });
                }
            }
        }
        Ok(())
    }

    async fn allocate_ports_for_server(
        &self,
        server_id: ServerId,
        requirements: &[PortRequirement],
        resource: ResourceRequirement,
    ) -> Result<Allocation> {
        let mut inner = self.inner.write();

        // Nodes with enough allocatable capacity left over once servers
        // already pinned there (and not terminal, invariant 4 / P2) are
        // subtracted out, ordered by free-port count descending so
        // concurrent allocations fan out rather than piling onto one node.
        let mut candidates: Vec<(String, usize)> = inner
            .nodes
            .values()
            .filter(|n| {
                if !n.active {
                    return false;
                }
                let (reserved_cpu, reserved_memory) = reserved_on_node(&inner, &n.name);
                n.allocatable_cpu_millicores - reserved_cpu >= resource.cpu_millicores
                    && n.allocatable_memory_bytes - reserved_memory >= resource.memory_bytes
            })
            .map(|n| {
                let free_ports =
                    inner.port_slots.iter().filter(|s| s.node_name == n.name && s.server_id.is_none()).count();
                (n.name.clone(), free_ports)
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        for (node_name, _free_ports) in candidates {
            let mut allocated = Vec::with_capacity(requirements.len());
            let mut claimed_indices = Vec::with_capacity(requirements.len());
            let mut ok = true;

            for req in requirements {
                let idx = inner.port_slots.iter().position(|s| {
                    s.node_name == node_name && s.protocol == req.protocol && s.server_id.is_none()
                });
                match idx {
                    Some(idx) => {
                        claimed_indices.push(idx);
                        allocated.push(AllocatedPort {
                            port_name: req.port_name.clone(),
                            protocol: req.protocol,
                            port: inner.port_slots[idx].port,
                        });
                        // tentatively mark claimed so subsequent requirements
                        // in this same loop don't double-claim the same slot
                        inner.port_slots[idx].server_id = Some(server_id);
                    }
                    None => {
                        ok = false;
                        break;
                    }
                }
            }

            if ok {
                let now = Utc::now();
                for (idx, port) in claimed_indices.iter().zip(allocated.iter()) {
                    inner.port_slots[*idx].port_name = Some(port.port_name.clone());
                    inner.port_slots[*idx].allocated_at = Some(now);
                }
                if let Some(server) = inner.servers.get_mut(&server_id) {
                    server.node_name = Some(node_name.clone());
                    server.reserved_cpu_millicores = resource.cpu_millicores;
                    server.reserved_memory_bytes = resource.memory_bytes;
                    server.updated_at = now;
                }
                let node = inner.nodes.get(&node_name).cloned().unwrap();
                return Ok(Allocation { node, ports: allocated });
            }

            // roll back the tentative claims before trying the next node
            for idx in claimed_indices {
                inner.port_slots[idx].server_id = None;
            }
        }

        Err(CoreError::capacity(format!(
            "no node with free ports and capacity for {} requirement(s)",
            requirements.len()
        )))
    }

    async fn release_server_ports(&self, server_id: ServerId) -> Result<()> {
        let mut inner = self.inner.write();
        for slot in inner.port_slots.iter_mut() {
            if slot.server_id == Some(server_id) {
                slot.server_id = None;
                slot.port_name = None;
                slot.allocated_at = None;
            }
        }
        if let Some(server) = inner.servers.get_mut(&server_id) {
            server.node_name = None;
            server.reserved_cpu_millicores = 0;
            server.reserved_memory_bytes = 0;
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn has_capacity(&self, resource: ResourceRequirement) -> Result<bool> {
        let inner = self.inner.read();
        Ok(inner.nodes.values().any(|n| {
            if !n.active {
                return false;
            }
            let (reserved_cpu, reserved_memory) = reserved_on_node(&inner, &n.name);
            n.allocatable_cpu_millicores - reserved_cpu >= resource.cpu_millicores
                && n.allocatable_memory_bytes - reserved_memory >= resource.memory_bytes
        }))
    }

    async fn create_pending_request(
        &self,
        user_id: UserId,
        display_name: &str,
        subdomain: &str,
        game: &str,
        plan: &str,
        payment_session_id: &str,
        resubscribe_server_id: Option<ServerId>,
        expires_at: DateTime<Utc>,
    ) -> Result<PendingRequest> {
        let mut inner = self.inner.write();
        let pending = PendingRequest {
            id: PendingRequestId::new(),
            user_id,
            display_name: display_name.to_string(),
            subdomain: subdomain.to_string(),
            game: game.to_string(),
            plan: plan.to_string(),
            status: PendingRequestStatus::AwaitingPayment,
            payment_session_id: payment_session_id.to_string(),
            resubscribe_server_id,
            created_at: Utc::now(),
            expires_at,
        };
        inner.pending_requests.insert(pending.id, pending.clone());
        Ok(pending)
    }

    async fn get_pending_request(&self, id: PendingRequestId) -> Result<Option<PendingRequest>> {
        Ok(self.inner.read().pending_requests.get(&id).cloned())
    }

    async fn get_pending_request_by_session(&self, payment_session_id: &str) -> Result<Option<PendingRequest>> {
        Ok(self
            .inner
            .read()
            .pending_requests
            .values()
            .find(|p| p.payment_session_id == payment_session_id)
            .cloned())
    }

    async fn mark_pending_request_completed(&self, id: PendingRequestId) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(p) = inner.pending_requests.get_mut(&id) {
            p.status = PendingRequestStatus::Completed;
        }
        Ok(())
    }

    async fn mark_pending_request_failed(&self, id: PendingRequestId) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(p) = inner.pending_requests.get_mut(&id) {
            p.status = PendingRequestStatus::Failed;
        }
        Ok(())
    }

    async fn delete_expired_pending_requests(&self) -> Result<u64> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let before = inner.pending_requests.len();
        inner
            .pending_requests
            .retain(|_, p| !(p.expires_at < now && p.status == PendingRequestStatus::AwaitingPayment));
        Ok((before - inner.pending_requests.len()) as u64)
    }

    async fn get_billing_event(&self, stripe_event_id: &str) -> Result<Option<BillingEvent>> {
        Ok(self.inner.read().billing_events.get(stripe_event_id).cloned())
    }

    async fn record_billing_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        status: BillingEventStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        inner.billing_events.insert(
            stripe_event_id.to_string(),
            BillingEvent {
                stripe_event_id: stripe_event_id.to_string(),
                event_type: event_type.to_string(),
                status,
                error: error.map(str::to_string),
                created_at: Utc::now(),
                processed_at: Some(Utc::now()),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_user(store: &MemoryStore) -> User {
        store.create_user("player@example.com", "hash").await.unwrap()
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = MemoryStore::new();
        new_user(&store).await;
        let err = store.create_user("player@example.com", "hash2").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_subdomain_is_rejected() {
        let store = MemoryStore::new();
        let user = new_user(&store).await;
        store
            .create_server(user.id, "My Server", "myserver", "minecraft", "small", None, "tok")
            .await
            .unwrap();
        let err = store
            .create_server(user.id, "Other", "myserver", "minecraft", "small", None, "tok2")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn transition_rejects_unexpected_current_state() {
        let store = MemoryStore::new();
        let user = new_user(&store).await;
        let server = store
            .create_server(user.id, "My Server", "myserver", "minecraft", "small", None, "tok")
            .await
            .unwrap();

        let ok = store
            .transition_server_status(server.id, &[ServerStatus::Starting], ServerStatus::Running, None)
            .await
            .unwrap();
        assert!(!ok);

        let ok = store
            .transition_server_status(server.id, &[ServerStatus::Pending], ServerStatus::Starting, None)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn allocation_fails_without_capacity() {
        let store = MemoryStore::new();
        let err = store
            .allocate_ports_for_server(
                ServerId::new(),
                &[PortRequirement { port_name: "game".into(), protocol: Protocol::Udp }],
                ResourceRequirement::new(500, 512),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Capacity(_)));
    }

    #[tokio::test]
    async fn allocation_reserves_distinct_ports_per_requirement() {
        let store = MemoryStore::new();
        let node = NodeName::from("node-1");
        store.upsert_node(&node, "203.0.113.5", 4000, 8_000_000_000).await.unwrap();
        store.initialize_node_ports(&node, 25500, 25502).await.unwrap();

        let allocation = store
            .allocate_ports_for_server(
                ServerId::new(),
                &[
                    PortRequirement { port_name: "game".into(), protocol: Protocol::Udp },
                    PortRequirement { port_name: "rcon".into(), protocol: Protocol::Tcp },
                ],
                ResourceRequirement::new(500, 512),
            )
            .await
            .unwrap();

        assert_eq!(allocation.ports.len(), 2);
        assert_ne!(allocation.ports[0].port, allocation.ports[1].port);
    }

    #[tokio::test]
    async fn allocation_respects_capacity_already_reserved_by_a_pinned_server() {
        let store = MemoryStore::new();
        let node = NodeName::from("node-1");
        store.upsert_node(&node, "203.0.113.5", 2000, 2_000_000_000).await.unwrap();
        store.initialize_node_ports(&node, 25500, 25510).await.unwrap();

        let user = new_user(&store).await;
        let first_server = store
            .create_server(user.id, "First", "first", "minecraft", "small", None, "tok1")
            .await
            .unwrap();
        let second_server = store
            .create_server(user.id, "Second", "second", "minecraft", "small", None, "tok2")
            .await
            .unwrap();

        let first = store
            .allocate_ports_for_server(
                first_server.id,
                &[PortRequirement { port_name: "game".into(), protocol: Protocol::Udp }],
                ResourceRequirement::new(2000, 2_000_000_000),
            )
            .await
            .unwrap();
        assert_eq!(first.node.name, "node-1");

        let pinned = store.get_server(first_server.id).await.unwrap().unwrap();
        assert_eq!(pinned.node_name.as_deref(), Some("node-1"));
        assert_eq!(pinned.reserved_cpu_millicores, 2000);
        assert_eq!(pinned.reserved_memory_bytes, 2_000_000_000);

        let err = store
            .allocate_ports_for_server(
                second_server.id,
                &[PortRequirement { port_name: "game".into(), protocol: Protocol::Udp }],
                ResourceRequirement::new(500, 500_000_000),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Capacity(_)), "node is fully reserved by the first server, second must fail");
    }

    #[tokio::test]
    async fn release_frees_the_node_pin_and_reserved_amounts() {
        let store = MemoryStore::new();
        let node = NodeName::from("node-1");
        store.upsert_node(&node, "203.0.113.5", 2000, 2_000_000_000).await.unwrap();
        store.initialize_node_ports(&node, 25500, 25510).await.unwrap();

        let user = new_user(&store).await;
        let server = store
            .create_server(user.id, "First", "first", "minecraft", "small", None, "tok1")
            .await
            .unwrap();

        store
            .allocate_ports_for_server(
                server.id,
                &[PortRequirement { port_name: "game".into(), protocol: Protocol::Udp }],
                ResourceRequirement::new(2000, 2_000_000_000),
            )
            .await
            .unwrap();

        store.release_server_ports(server.id).await.unwrap();

        let released = store.get_server(server.id).await.unwrap().unwrap();
        assert!(released.node_name.is_none());
        assert_eq!(released.reserved_cpu_millicores, 0);
        assert_eq!(released.reserved_memory_bytes, 0);

        // with the pin released, a fresh allocation for the full capacity succeeds again
        let second_user = store.create_user("player2@example.com", "hash").await.unwrap();
        let second_server = store
            .create_server(second_user.id, "Second", "second", "minecraft", "small", None, "tok2")
            .await
            .unwrap();
        let reallocated = store
            .allocate_ports_for_server(
                second_server.id,
                &[PortRequirement { port_name: "game".into(), protocol: Protocol::Udp }],
                ResourceRequirement::new(2000, 2_000_000_000),
            )
            .await
            .unwrap();
        assert_eq!(reallocated.node.name, "node-1");
    }

    #[tokio::test]
    async fn billing_event_idempotency_record_roundtrips() {
        let store = MemoryStore::new();
        assert!(store.get_billing_event("evt_1").await.unwrap().is_none());
        store
            .record_billing_event("evt_1", "checkout.session.completed", BillingEventStatus::Completed, None)
            .await
            .unwrap();
        let event = store.get_billing_event("evt_1").await.unwrap().unwrap();
        assert_eq!(event.status, BillingEventStatus::Completed);
    }
}
