//! The relational store abstraction (§4.1)
//!
//! ## Table of Contents
//! - **Store**: async trait covering every durable operation the core needs
//! - **postgres**: [`postgres::PgStore`], the production backend
//! - **memory**: [`memory::MemoryStore`], an in-process fake for tests
//!
//! `Store` is the seam between the lifecycle/reconciler/billing modules and
//! durability. Every mutation that must be atomic with a status check (port
//! allocation, status transition, webhook idempotency) is a single method
//! here rather than a read-then-write pair the caller assembles, so the
//! locking strategy lives entirely behind this trait.

pub mod memory;
pub mod models;
pub mod postgres;

use crate::error::Result;
use crate::types::{NodeName, PendingRequestId, ServerId, ServerStatus, UserId};
use async_trait::async_trait;
use models::*;
use std::collections::HashMap;

pub use postgres::PgStore;

/// Durable state for the control plane.
///
/// Implementors must uphold invariant 5 (§3): `transition_server_status` is
/// the only path that changes a server's `status` column.
#[async_trait]
pub trait Store: Send + Sync {
    // -- users --------------------------------------------------------

    async fn create_user(&self, email: &str, password_hash: &str) -> Result<User>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn get_user_by_id(&self, id: UserId) -> Result<Option<User>>;
    async fn mark_email_verified(&self, id: UserId) -> Result<()>;
    async fn update_user_password(&self, id: UserId, password_hash: &str) -> Result<()>;
    async fn set_billing_customer_handle(&self, id: UserId, handle: &str) -> Result<()>;

    // -- servers --------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn create_server(
        &self,
        user_id: UserId,
        display_name: &str,
        subdomain: &str,
        game: &str,
        plan: &str,
        subscription_handle: Option<&str>,
        auth_token: &str,
    ) -> Result<Server>;

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>>;
    async fn get_server_with_details(&self, id: ServerId) -> Result<Option<ServerWithDetails>>;
    async fn list_servers_by_user(&self, user_id: UserId) -> Result<Vec<Server>>;
    async fn list_all_servers(&self) -> Result<Vec<Server>>;
    async fn list_servers_by_status(&self, status: ServerStatus) -> Result<Vec<Server>>;
    async fn subdomain_exists(&self, subdomain: &str) -> Result<bool>;
    async fn get_server_by_subscription_handle(&self, handle: &str) -> Result<Option<Server>>;

    /// Transition `id` from one of `from` to `to`, returning `false` (not an
    /// error) if the server's current status is not in `from` — the
    /// compare-and-swap primitive every state change in §4.5 is built on.
    async fn transition_server_status(
        &self,
        id: ServerId,
        from: &[ServerStatus],
        to: ServerStatus,
        message: Option<&str>,
    ) -> Result<bool>;

    async fn set_server_env_overrides(
        &self,
        id: ServerId,
        overrides: Option<HashMap<String, String>>,
    ) -> Result<()>;

    async fn record_heartbeat(&self, id: ServerId) -> Result<()>;
    async fn set_creation_error(&self, id: ServerId, error: &str) -> Result<()>;
    async fn set_delete_after(&self, id: ServerId, delete_after: Option<chrono::DateTime<chrono::Utc>>) -> Result<()>;
    async fn touch_reconciled(&self, id: ServerId) -> Result<()>;
    async fn hard_delete_server(&self, id: ServerId) -> Result<()>;

    // -- nodes and ports --------------------------------------------------------

    async fn upsert_node(
        &self,
        name: &NodeName,
        public_ip: &str,
        allocatable_cpu_millicores: i64,
        allocatable_memory_bytes: i64,
    ) -> Result<()>;

    async fn set_node_active(&self, name: &NodeName, active: bool) -> Result<()>;
    async fn list_active_nodes(&self) -> Result<Vec<Node>>;
    async fn initialize_node_ports(&self, node: &NodeName, min_port: u16, max_port: u16) -> Result<()>;

    /// Atomically pick a node with free capacity (after subtracting the
    /// reserved amounts of servers already pinned there, invariant 4 / P2)
    /// and reserve one port per entry in `requirements`, or return
    /// `CoreError::Capacity` if none qualifies (§4.3's allocation
    /// algorithm). On success, persists the pin itself: `node_name`,
    /// `reserved_cpu_millicores` and `reserved_memory_bytes` on the server
    /// row are set atomically with the port reservations (§4.3 step 5).
    async fn allocate_ports_for_server(
        &self,
        server_id: ServerId,
        requirements: &[PortRequirement],
        resource: crate::types::ResourceRequirement,
    ) -> Result<Allocation>;

    /// Release a server's port and node reservations: clears its port
    /// slots and zeroes `node_name`/`reserved_cpu_millicores`/
    /// `reserved_memory_bytes` on the server row.
    async fn release_server_ports(&self, server_id: ServerId) -> Result<()>;

    /// Read-only probe: would allocation currently succeed for `resource`?
    async fn has_capacity(&self, resource: crate::types::ResourceRequirement) -> Result<bool>;

    // -- pending requests (checkout) --------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn create_pending_request(
        &self,
        user_id: UserId,
        display_name: &str,
        subdomain: &str,
        game: &str,
        plan: &str,
        payment_session_id: &str,
        resubscribe_server_id: Option<ServerId>,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<PendingRequest>;

    async fn get_pending_request(&self, id: PendingRequestId) -> Result<Option<PendingRequest>>;
    async fn get_pending_request_by_session(&self, payment_session_id: &str) -> Result<Option<PendingRequest>>;
    async fn mark_pending_request_completed(&self, id: PendingRequestId) -> Result<()>;
    async fn mark_pending_request_failed(&self, id: PendingRequestId) -> Result<()>;
    async fn delete_expired_pending_requests(&self) -> Result<u64>;

    // -- billing events (webhook idempotency, invariant 6) --------------------------------------------------------

    async fn get_billing_event(&self, stripe_event_id: &str) -> Result<Option<BillingEvent>>;

    async fn record_billing_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        status: BillingEventStatus,
        error: Option<&str>,
    ) -> Result<()>;
}
