//! Row types for the relational store (§3 Data Model)

use crate::types::{NodeName, PendingRequestId, Protocol, ServerId, ServerStatus, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A registered platform user
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub password_hash: String,
    pub email_verified: bool,
    pub billing_customer_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A customer-owned game-server workload (§3)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: ServerId,
    pub user_id: UserId,
    pub display_name: String,
    pub subdomain: String,
    pub game: String,
    pub plan: String,
    pub status: ServerStatus,
    pub status_message: Option<String>,
    pub subscription_handle: Option<String>,
    /// Stored as a JSON object; `None` means "no override", distinct from
    /// an empty map, per the full-override semantics of `MergeEnvVars`.
    pub env_overrides: Option<serde_json::Value>,
    pub auth_token: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub node_name: Option<String>,
    pub reserved_cpu_millicores: i64,
    pub reserved_memory_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub delete_after: Option<DateTime<Utc>>,
    pub last_reconciled: Option<DateTime<Utc>>,
    pub creation_error: Option<String>,
}

impl Server {
    /// Decode `env_overrides` into a typed map, if present
    pub fn env_overrides_map(&self) -> Option<HashMap<String, String>> {
        self.env_overrides
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The node this server is pinned to, as a typed [`NodeName`]
    pub fn node(&self) -> Option<NodeName> {
        self.node_name.clone().map(NodeName)
    }
}

/// A port reservation belonging to `server_id`, returned alongside a Server
/// by `GetServerWithDetails`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PortAllocation {
    pub node_name: String,
    pub port: i32,
    pub protocol: Protocol,
    pub port_name: String,
    pub allocated_at: DateTime<Utc>,
}

/// A Server joined with its current port allocations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerWithDetails {
    pub server: Server,
    pub ports: Vec<PortAllocation>,
}

/// Status of a not-yet-paid checkout reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingRequestStatus {
    AwaitingPayment,
    Completed,
    Failed,
}

impl fmt::Display for PendingRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PendingRequestStatus::AwaitingPayment => "awaiting_payment",
            PendingRequestStatus::Completed => "completed",
            PendingRequestStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PendingRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_payment" => Ok(PendingRequestStatus::AwaitingPayment),
            "completed" => Ok(PendingRequestStatus::Completed),
            "failed" => Ok(PendingRequestStatus::Failed),
            other => Err(format!("unknown pending request status: {other}")),
        }
    }
}

crate::text_sql_type!(PendingRequestStatus);

/// A reserved (subdomain, game, plan) awaiting payment confirmation (§3)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingRequest {
    pub id: PendingRequestId,
    pub user_id: UserId,
    pub display_name: String,
    pub subdomain: String,
    pub game: String,
    pub plan: String,
    pub status: PendingRequestStatus,
    pub payment_session_id: String,
    /// Set only for the resubscribe flow (§4.7): the expired server this
    /// checkout will reactivate instead of creating a new row.
    pub resubscribe_server_id: Option<ServerId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A worker node eligible for game workloads (§3)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Node {
    pub name: String,
    pub public_ip: String,
    pub active: bool,
    pub allocatable_cpu_millicores: i64,
    pub allocatable_memory_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One (node, port, protocol) reservation unit (§3)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PortSlot {
    pub node_name: String,
    pub port: i32,
    pub protocol: Protocol,
    pub server_id: Option<ServerId>,
    pub port_name: Option<String>,
    pub allocated_at: Option<DateTime<Utc>>,
}

/// Outcome recorded for a processed billing webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingEventStatus {
    Completed,
    Failed,
}

impl fmt::Display for BillingEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BillingEventStatus::Completed => "completed",
            BillingEventStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BillingEventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(BillingEventStatus::Completed),
            "failed" => Ok(BillingEventStatus::Failed),
            other => Err(format!("unknown billing event status: {other}")),
        }
    }
}

crate::text_sql_type!(BillingEventStatus);

/// Append-only record of a processed payment-gateway event (§3, invariant 6)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingEvent {
    pub stripe_event_id: String,
    pub event_type: String,
    pub status: BillingEventStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A single port requirement, e.g. `("game", Protocol::Udp)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRequirement {
    pub port_name: String,
    pub protocol: Protocol,
}

/// Result of a successful `AllocatePortsForServer` call (§4.1, §4.3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub node: Node,
    pub ports: Vec<AllocatedPort>,
}

/// One port handed back by the allocator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatedPort {
    pub port_name: String,
    pub protocol: Protocol,
    pub port: i32,
}
