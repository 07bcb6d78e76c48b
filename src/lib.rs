//! # gamehost-control-plane
//!
//! The server lifecycle engine for a multi-tenant game-server hosting
//! platform: it owns the data model, port/capacity allocation, the server
//! state machine, billing-driven lifecycle transitions, and the
//! core-relevant HTTP surface (checkout, start/stop/restart, status and log
//! streaming, webhooks, supervisor ingress). Session/JWT auth, the
//! marketing-facing API, and the actual payment-gateway SDK are treated as
//! external collaborators (see `SPEC_FULL.md` §1) and are not implemented
//! here.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gamehost_control_plane::{Config, ControlPlaneBuilder};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> gamehost_control_plane::Result<()> {
//!     let config = Config::from_env()?;
//!     let plane = Arc::new(ControlPlaneBuilder::new(config).build().await?);
//!     plane.run().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod allocator;
pub mod billing;
pub mod builder;
pub mod catalog;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod lifecycle;
pub mod metrics;
pub mod nodesync;
pub mod orchestrator;
pub mod reconciler;
pub mod resilience;
pub mod runtime;
pub mod store;
pub mod supervisor_gateway;
pub mod types;

// Re-exports for ergonomic API
pub use allocator::Allocator;
pub use billing::{BillingBridge, PaymentGateway};
pub use builder::ControlPlaneBuilder;
pub use catalog::GameCatalog;
pub use config::Config;
pub use error::{CoreError, Result};
pub use hub::Hub;
pub use lifecycle::Lifecycle;
pub use metrics::CoreMetrics;
pub use nodesync::NodeSync;
pub use orchestrator::{NomadOrchestrator, Orchestrator};
pub use reconciler::Reconciler;
pub use runtime::ControlPlane;
pub use store::{PgStore, Store};
pub use supervisor_gateway::SupervisorGateway;
pub use types::{NodeName, PendingRequestId, ServerId, ServerStatus, UserId};

/// Convenient imports for binaries embedding this crate.
pub mod prelude {
    pub use crate::builder::ControlPlaneBuilder;
    pub use crate::config::Config;
    pub use crate::error::{CoreError, Result};
    pub use crate::runtime::ControlPlane;
    pub use crate::types::{ServerId, ServerStatus, UserId};
}
