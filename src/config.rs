//! Process configuration, loaded from the environment
//!
//! ## Table of Contents
//! - **Config**: every environment variable enumerated in spec §6
//!
//! Layering follows the `dotenvy` + `config` convention: a `.env` file (if
//! present) is loaded into the process environment first, then `config`
//! reads from the environment with a `CP_` prefix and `__` as the nesting
//! separator (e.g. `CP__PORT_RANGE_MIN`).

use crate::error::{CoreError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Complete control-plane configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Postgres connection string
    pub db_url: String,

    /// Auth secrets — opaque to this core, consumed by the external auth
    /// collaborator (spec §1), but configured in the same process.
    pub jwt_secret: String,
    /// Access token lifetime in seconds
    pub jwt_access_expiry_secs: u64,
    /// Refresh token lifetime in seconds
    pub jwt_refresh_expiry_secs: u64,

    /// Payment-gateway API secret
    pub payment_secret: String,
    /// Payment-gateway webhook signing secret
    pub payment_webhook_secret: String,
    /// game name -> gateway price id, used at checkout
    pub game_price_ids: HashMap<String, String>,

    /// Orchestrator namespace to operate in
    pub orch_namespace: String,
    /// Name of the config-store document holding the game catalog
    pub orch_game_catalog_name: String,
    /// Orchestrator API base URL (e.g. a Nomad HTTP API endpoint)
    pub orch_api: String,
    /// Orchestrator ACL token, if required
    pub orch_token: Option<String>,

    /// Lowest host port handed out by the allocator
    pub port_range_min: u16,
    /// Highest host port handed out by the allocator
    pub port_range_max: u16,

    /// Node label identifying gameserver-eligible workers
    pub node_role_label: String,
    /// Node label carrying the worker's public IP
    pub public_ip_label: String,

    /// Reconciler tick cadence
    pub reconcile_interval_secs: u64,
    /// NodeSync cadence
    pub nodesync_interval_secs: u64,
    /// Expired-server cleanup cadence
    pub cleanup_interval_secs: u64,
    /// Grace period a server spends in `expired` before hard deletion
    pub grace_period_secs: u64,
    /// Fraction of a node's allocatable capacity usable by game workloads
    pub overhead_factor: f64,
    /// Delay before the stop fallback forces `stopping -> stopped`
    pub stop_fallback_delay_secs: u64,
    /// Window within which a `running`/`starting` server's heartbeat counts as fresh
    pub heartbeat_freshness_secs: u64,

    /// HTTP bind address for the core-relevant surface (§6)
    pub http_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "postgres://localhost/gamehost".to_string(),
            jwt_secret: String::new(),
            jwt_access_expiry_secs: 900,
            jwt_refresh_expiry_secs: 60 * 60 * 24 * 30,
            payment_secret: String::new(),
            payment_webhook_secret: String::new(),
            game_price_ids: HashMap::new(),
            orch_namespace: "default".to_string(),
            orch_game_catalog_name: "games.yaml".to_string(),
            orch_api: "http://127.0.0.1:4646".to_string(),
            orch_token: None,
            port_range_min: 25500,
            port_range_max: 25999,
            node_role_label: "gameserver".to_string(),
            public_ip_label: "public-ip".to_string(),
            reconcile_interval_secs: 30,
            nodesync_interval_secs: 300,
            cleanup_interval_secs: 3600,
            grace_period_secs: 7 * 24 * 3600,
            overhead_factor: 0.90,
            stop_fallback_delay_secs: 90,
            heartbeat_freshness_secs: 60,
            http_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `.env` (if present) plus the process
    /// environment, falling back to [`Config::default`] for anything unset.
    ///
    /// Missing required fields (`db_url`, `payment_webhook_secret`) are a
    /// startup-time `CoreError::Config`, never a panic, per spec §9.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default()).map_err(|e| {
                CoreError::config(format!("failed to seed config defaults: {}", e))
            })?)
            .add_source(
                config::Environment::with_prefix("CP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| CoreError::config(format!("failed to build configuration: {}", e)))?;

        let cfg: Config = settings
            .try_deserialize()
            .map_err(|e| CoreError::config(format!("failed to parse configuration: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.db_url.is_empty() {
            return Err(CoreError::config("db_url must be set"));
        }
        if self.payment_webhook_secret.is_empty() {
            return Err(CoreError::config("payment_webhook_secret must be set"));
        }
        if self.port_range_min >= self.port_range_max {
            return Err(CoreError::config("port_range_min must be < port_range_max"));
        }
        if !(0.0..=1.0).contains(&self.overhead_factor) {
            return Err(CoreError::config("overhead_factor must be in [0, 1]"));
        }
        Ok(())
    }

    /// Grace period as a [`Duration`]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Reconciler cadence as a [`Duration`]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// NodeSync cadence as a [`Duration`]
    pub fn nodesync_interval(&self) -> Duration {
        Duration::from_secs(self.nodesync_interval_secs)
    }

    /// Cleanup cadence as a [`Duration`]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Stop-fallback delay as a [`Duration`]
    pub fn stop_fallback_delay(&self) -> Duration {
        Duration::from_secs(self.stop_fallback_delay_secs)
    }

    /// Heartbeat freshness window as a [`Duration`]
    pub fn heartbeat_freshness(&self) -> Duration {
        Duration::from_secs(self.heartbeat_freshness_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_secret() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn port_range_validation() {
        let mut cfg = Config::default();
        cfg.payment_webhook_secret = "whsec".to_string();
        cfg.port_range_min = 100;
        cfg.port_range_max = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stop_fallback_exceeds_default_grace_window_is_not_assumed() {
        // Sanity check tying the two constants from spec §5/§9 together:
        // the fallback window must be evaluated against the *grace period*
        // for expiry, not conflated with it. They're independent knobs.
        let cfg = Config::default();
        assert_eq!(cfg.stop_fallback_delay_secs, 90);
        assert_eq!(cfg.grace_period_secs, 7 * 24 * 3600);
    }
}
