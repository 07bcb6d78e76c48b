//! Shared identifiers and small value types
//!
//! ## Table of Contents
//! - **UserId / ServerId / PendingRequestId**: newtype UUIDs
//! - **NodeName**: worker identity
//! - **ServerStatus**: the Lifecycle state machine's states (§4.5)
//! - **Protocol**: port protocol (TCP/UDP)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
        )]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(UserId);
uuid_id!(ServerId);
uuid_id!(PendingRequestId);

/// Worker node identity (human-assigned, unlike the UUID-based ids above)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeName(pub String);

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Port protocol for a PortSlot (§3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP port
    Tcp,
    /// UDP port
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

crate::text_sql_type!(Protocol);

/// Server lifecycle states (spec §4.5)
///
/// The only sanctioned way to change a server's status is through
/// [`crate::store::Store::transition_server_status`]; no other writer
/// touches this field (invariant 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Paid, not yet scheduled
    Pending,
    /// Reconciler has allocated capacity and asked the orchestrator to create the workload
    Starting,
    /// Supervisor or orchestrator confirms the workload is ready
    Running,
    /// User requested stop; workload is being scaled to zero
    Stopping,
    /// Workload confirmed at zero replicas
    Stopped,
    /// Unrecoverable creation error
    Failed,
    /// Subscription cancelled; grace period running
    Expired,
    /// Cleanup cycle is tearing down the durable volume
    Deleting,
    /// Terminal; row is removed shortly after reaching this state
    Deleted,
}

impl ServerStatus {
    /// All states, for exhaustive iteration in tests and admin tooling
    pub const ALL: [ServerStatus; 9] = [
        ServerStatus::Pending,
        ServerStatus::Starting,
        ServerStatus::Running,
        ServerStatus::Stopping,
        ServerStatus::Stopped,
        ServerStatus::Failed,
        ServerStatus::Expired,
        ServerStatus::Deleting,
        ServerStatus::Deleted,
    ];

    /// States excluded from capacity accounting (invariant 4 / P2): a
    /// server in one of these states no longer holds a live reservation.
    pub fn excluded_from_capacity(self) -> bool {
        matches!(self, ServerStatus::Deleted | ServerStatus::Expired | ServerStatus::Failed)
    }

    /// States from which a user-initiated stop is allowed
    pub fn stoppable_from() -> &'static [ServerStatus] {
        &[ServerStatus::Running, ServerStatus::Starting, ServerStatus::Pending]
    }

    /// States from which a user-initiated restart is allowed (§9: restart
    /// always releases ports and reallocates on the next reconcile tick,
    /// never reuses the prior reservation)
    pub fn restartable_from() -> &'static [ServerStatus] {
        &[ServerStatus::Running, ServerStatus::Starting, ServerStatus::Stopped, ServerStatus::Failed]
    }

    /// States from which a subscription-deleted webhook expires the server
    pub fn expirable_from() -> &'static [ServerStatus] {
        &[
            ServerStatus::Pending,
            ServerStatus::Starting,
            ServerStatus::Running,
            ServerStatus::Stopping,
            ServerStatus::Stopped,
        ]
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Pending => "pending",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Failed => "failed",
            ServerStatus::Expired => "expired",
            ServerStatus::Deleting => "deleting",
            ServerStatus::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ServerStatus::Pending),
            "starting" => Ok(ServerStatus::Starting),
            "running" => Ok(ServerStatus::Running),
            "stopping" => Ok(ServerStatus::Stopping),
            "stopped" => Ok(ServerStatus::Stopped),
            "failed" => Ok(ServerStatus::Failed),
            "expired" => Ok(ServerStatus::Expired),
            "deleting" => Ok(ServerStatus::Deleting),
            "deleted" => Ok(ServerStatus::Deleted),
            other => Err(format!("unknown server status: {other}")),
        }
    }
}

crate::text_sql_type!(ServerStatus);

/// Maps a `FromStr + Display` enum onto a Postgres `TEXT` column, so the
/// runtime-checked `sqlx::query`/`query_as` API can decode it without a
/// compile-time schema cache (no `sqlx::query!` is used anywhere in this
/// crate; see `src/store/postgres.rs`).
#[macro_export]
macro_rules! text_sql_type {
    ($name:ident) => {
        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <String as sqlx::Type<sqlx::Postgres>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> std::result::Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                s.parse::<$name>().map_err(|e: String| e.into())
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>>
            {
                <String as sqlx::Encode<sqlx::Postgres>>::encode(self.to_string(), buf)
            }
        }
    };
}

/// Resource reservation, shared by the catalog's plans and the allocator's
/// requirement input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// CPU request in millicores
    pub cpu_millicores: i64,
    /// Memory request in bytes
    pub memory_bytes: i64,
}

impl ResourceRequirement {
    /// Construct a new requirement
    pub fn new(cpu_millicores: i64, memory_bytes: i64) -> Self {
        Self { cpu_millicores, memory_bytes }
    }

    /// Apply the configured overhead factor (spec §4.3), inflating the
    /// requirement so the allocator reserves headroom for system overhead.
    pub fn with_overhead(self, overhead_factor: f64) -> Self {
        Self {
            cpu_millicores: ((self.cpu_millicores as f64) / overhead_factor).ceil() as i64,
            memory_bytes: ((self.memory_bytes as f64) / overhead_factor).ceil() as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_factor_inflates_requirement() {
        let req = ResourceRequirement::new(900, 900).with_overhead(0.90);
        assert_eq!(req.cpu_millicores, 1000);
        assert_eq!(req.memory_bytes, 1000);
    }

    #[test]
    fn excluded_states_match_invariant_4() {
        assert!(ServerStatus::Deleted.excluded_from_capacity());
        assert!(ServerStatus::Expired.excluded_from_capacity());
        assert!(ServerStatus::Failed.excluded_from_capacity());
        assert!(!ServerStatus::Running.excluded_from_capacity());
    }

    #[test]
    fn id_display_roundtrips_uuid() {
        let id = ServerId::new();
        let text = id.to_string();
        assert_eq!(text, id.0.to_string());
    }
}
