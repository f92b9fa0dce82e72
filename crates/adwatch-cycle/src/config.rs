use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;

/// Scope registry loaded from `scopes.yaml`: which sources run and
/// which scope codes each one reconciles.
#[derive(Debug, Clone, Deserialize)]
pub struct ScopeRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub enabled: bool,
    pub rotation: Rotation,
    pub scopes: Vec<String>,
}

/// How a source walks its scope list per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    /// One scope per cycle, advancing through the list.
    RoundRobin,
    /// Every scope, every cycle.
    FullSweep,
}

impl ScopeRegistry {
    pub async fn load(path: &PathBuf) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub data_dir: PathBuf,
    pub registry_path: PathBuf,
    pub webhook_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub cycle_cron: String,
    pub enrichment_delay_ms: u64,
}

impl CycleConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("ADWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            registry_path: std::env::var("ADWATCH_SCOPES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./scopes.yaml")),
            webhook_url: std::env::var("ADWATCH_WEBHOOK_URL").ok(),
            user_agent: std::env::var("ADWATCH_USER_AGENT")
                .unwrap_or_else(|_| "adwatch/0.1".to_string()),
            http_timeout_secs: std::env::var("ADWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("ADWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cycle_cron: std::env::var("ADWATCH_CYCLE_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            enrichment_delay_ms: std::env::var("ADWATCH_ENRICHMENT_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_yaml_parses_rotation_modes() {
        let yaml = r#"
sources:
  - source_id: classified-ads
    enabled: true
    rotation: round_robin
    scopes: ["13110", "13107"]
  - source_id: rental-rooms
    enabled: false
    rotation: full_sweep
    scopes: ["769"]
"#;
        let registry: ScopeRegistry = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.sources[0].rotation, Rotation::RoundRobin);
        assert_eq!(registry.sources[1].rotation, Rotation::FullSweep);
        assert!(!registry.sources[1].enabled);
    }
}
