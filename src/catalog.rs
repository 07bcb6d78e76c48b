//! GameCatalog (C4): the read-only games/plans catalog (§4.4)
//!
//! Loaded once at startup from a document in the orchestrator's config
//! store (`games.yaml`) and held in memory for the process lifetime; there
//! is no live-reload path in this core (an operator restarts to pick up
//! catalog changes).

use crate::error::{CoreError, Result};
use crate::orchestrator::Orchestrator;
use crate::types::{Protocol, ResourceRequirement};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One exposed port a game's supervisor listens on
#[derive(Debug, Clone, Deserialize)]
pub struct PortDescriptor {
    pub port_name: String,
    pub container_port: u16,
    pub protocol: Protocol,
}

/// A durable volume mount the workload needs
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeDescriptor {
    pub volume_name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: Option<String>,
}

/// Liveness/readiness probe description, passed through to the orchestrator
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheck {
    pub port_name: String,
    #[serde(default = "default_health_check_path")]
    pub path: String,
    #[serde(default = "default_health_check_period_secs")]
    pub period_secs: u64,
}

fn default_health_check_path() -> String {
    "/".to_string()
}

fn default_health_check_period_secs() -> u64 {
    15
}

/// How the supervisor starts (and optionally stops) the game process
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessDescriptor {
    pub start_command: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default)]
    pub stop_command: Option<String>,
}

fn default_grace_period_secs() -> u64 {
    30
}

/// A single plan tier (small/medium/large, …)
#[derive(Debug, Clone, Deserialize)]
pub struct PlanConfig {
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    pub storage_bytes: i64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl PlanConfig {
    pub fn resource_requirement(&self) -> ResourceRequirement {
        ResourceRequirement::new(self.cpu_millicores, self.memory_bytes)
    }
}

/// One supported game: image, ports, volumes, defaults, and its plan map
#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    pub name: String,
    pub supervisor_image: String,
    pub ports: Vec<PortDescriptor>,
    #[serde(default)]
    pub volumes: Vec<VolumeDescriptor>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    #[serde(default)]
    pub process: Option<ProcessDescriptor>,
    pub plans: HashMap<String, PlanConfig>,
}

impl GameConfig {
    pub fn plan(&self, plan: &str) -> Result<&PlanConfig> {
        self.plans
            .get(plan)
            .ok_or_else(|| CoreError::catalog(format!("unknown plan '{plan}' for game '{}'", self.name)))
    }

    pub fn port_requirements(&self) -> Vec<crate::store::models::PortRequirement> {
        self.ports
            .iter()
            .map(|p| crate::store::models::PortRequirement {
                port_name: p.port_name.clone(),
                protocol: p.protocol,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    games: Vec<GameConfig>,
}

/// In-memory, read-only games/plans catalog
pub struct GameCatalog {
    games: HashMap<String, GameConfig>,
}

impl GameCatalog {
    /// Fetch `document_name` from the orchestrator's config store and parse
    /// it as a catalog document.
    pub async fn load(orchestrator: &Arc<dyn Orchestrator>, namespace: &str, document_name: &str) -> Result<Self> {
        let raw = orchestrator.get_config_document(namespace, document_name).await?;
        let doc: CatalogDocument = serde_json::from_value(raw)
            .map_err(|e| CoreError::catalog(format!("failed to parse game catalog: {e}")))?;
        let games: HashMap<String, GameConfig> = doc.games.into_iter().map(|g| (g.name.clone(), g)).collect();
        info!(count = games.len(), "game catalog loaded");
        Ok(Self { games })
    }

    /// Build a catalog directly from already-parsed games (used by tests).
    pub fn from_games(games: Vec<GameConfig>) -> Self {
        Self { games: games.into_iter().map(|g| (g.name.clone(), g)).collect() }
    }

    pub fn game(&self, name: &str) -> Result<&GameConfig> {
        self.games
            .get(name)
            .ok_or_else(|| CoreError::catalog(format!("unknown game '{name}'")))
    }

    pub fn games(&self) -> impl Iterator<Item = &GameConfig> {
        self.games.values()
    }
}

/// Environment resolution order (§4.4): `user_overrides`, if present,
/// *replaces* the merged defaults entirely. Otherwise `plan_env` is
/// overlaid onto `game_env` (plan wins on conflict).
pub fn merge_env_vars(
    game_env: &HashMap<String, String>,
    plan_env: &HashMap<String, String>,
    user_overrides: Option<&HashMap<String, String>>,
) -> HashMap<String, String> {
    if let Some(overrides) = user_overrides {
        return overrides.clone();
    }
    let mut merged = game_env.clone();
    merged.extend(plan_env.clone());
    merged
}

/// Validate a user-supplied env override map against §7's "malformed env
/// key/value" validation error.
pub fn validate_env_overrides(overrides: &HashMap<String, String>) -> Result<()> {
    for key in overrides.keys() {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CoreError::validation(format!("invalid env var name: '{key}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn merge_without_overrides_lets_plan_win() {
        let game = map(&[("A", "1"), ("B", "2")]);
        let plan = map(&[("B", "3"), ("C", "4")]);
        let merged = merge_env_vars(&game, &plan, None);
        assert_eq!(merged.get("A").unwrap(), "1");
        assert_eq!(merged.get("B").unwrap(), "3");
        assert_eq!(merged.get("C").unwrap(), "4");
    }

    #[test]
    fn merge_with_overrides_replaces_entirely() {
        let game = map(&[("A", "1")]);
        let plan = map(&[("B", "2")]);
        let overrides = map(&[("Z", "9")]);
        let merged = merge_env_vars(&game, &plan, Some(&overrides));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("Z").unwrap(), "9");
    }

    #[test]
    fn env_validation_rejects_bad_keys() {
        let bad = map(&[("bad-key", "v")]);
        assert!(validate_env_overrides(&bad).is_err());
        let good = map(&[("GOOD_KEY", "v")]);
        assert!(validate_env_overrides(&good).is_ok());
    }

    #[test]
    fn unknown_plan_is_a_catalog_error() {
        let game = GameConfig {
            name: "minecraft".into(),
            supervisor_image: "img".into(),
            ports: vec![],
            volumes: vec![],
            env: HashMap::new(),
            health_check: None,
            process: None,
            plans: HashMap::new(),
        };
        assert!(matches!(game.plan("small"), Err(CoreError::Catalog(_))));
    }
}
