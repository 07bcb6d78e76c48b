//! Error types for the control plane
//!
//! ## Table of Contents
//! - **CoreError**: Main error enum covering all failure modes from spec §7
//! - **Result**: Type alias for `Result<T, CoreError>`

use thiserror::Error;

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for the server lifecycle engine
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad input, unknown game/plan, duplicate subdomain, malformed env
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown user, server not owned, invalid supervisor token
    #[error("authorization error: {0}")]
    Authorization(String),

    /// `TransitionServerStatusFrom` returned false, or an already-processed webhook
    #[error("conflict: {0}")]
    Conflict(String),

    /// No node has sufficient free ports/capacity for a requirement
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// Transient store/orchestrator failure; safe to retry on the next tick
    #[error("transient error: {0}")]
    Transient(String),

    /// Missing or invalid game/plan configuration for an existing server
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Billing webhook processing failure
    #[error("billing error: {0}")]
    Billing(String),

    /// Store backend failure
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Orchestrator communication failure
    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration, detected at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation (should not occur in normal operation)
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an authorization error
    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a capacity-exhausted error
    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a catalog error
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a billing error
    pub fn billing(msg: impl Into<String>) -> Self {
        Self::Billing(msg.into())
    }

    /// Create an orchestrator error
    pub fn orchestrator(msg: impl Into<String>) -> Self {
        Self::Orchestrator(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify whether the Reconciler should retry this error on its next
    /// tick rather than transitioning the server to `failed`.
    ///
    /// Capacity exhaustion and transient store/orchestrator errors are
    /// retriable; catalog errors are terminal (spec §7).
    pub fn retriable(&self) -> bool {
        matches!(self, Self::Capacity(_) | Self::Transient(_) | Self::Store(_))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Orchestrator(err.to_string())
    }
}

impl From<prometheus::Error> for CoreError {
    fn from(err: prometheus::Error) -> Self {
        Self::Internal(format!("metrics: {}", err))
    }
}
