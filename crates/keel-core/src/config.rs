//! keel.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub environment: EnvironmentConfig,
    pub scheduler: SchedulerConfig,
    pub rehearsal: RehearsalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub name: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
        }
    }
}

/// Periodic triggers. A missing interval disables that timer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub deploy_interval_secs: Option<u64>,
    pub repair_interval_secs: Option<u64>,
    pub fact_refresh_interval_secs: Option<u64>,
}

impl SchedulerConfig {
    pub fn deploy_interval(&self) -> Option<Duration> {
        positive_secs(self.deploy_interval_secs)
    }

    pub fn repair_interval(&self) -> Option<Duration> {
        positive_secs(self.repair_interval_secs)
    }

    pub fn fact_refresh_interval(&self) -> Option<Duration> {
        positive_secs(self.fact_refresh_interval_secs)
    }
}

/// Settings for the daemon's rehearsal executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RehearsalConfig {
    /// Simulated time spent per deploy.
    pub deploy_delay_ms: u64,
    /// Resource ids reported as failed.
    pub fail: Vec<String>,
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeelConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn positive_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config: KeelConfig = toml::from_str("").unwrap();
        assert_eq!(config.environment.name, "default");
        assert!(config.scheduler.deploy_interval().is_none());
        assert!(config.rehearsal.fail.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
[environment]
name = "prod"

[scheduler]
deploy_interval_secs = 600
repair_interval_secs = 0

[rehearsal]
deploy_delay_ms = 25
fail = ["std::File[h1,path=/a]"]
"#;
        let config: KeelConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.environment.name, "prod");
        assert_eq!(config.scheduler.deploy_interval(), Some(Duration::from_secs(600)));
        // Zero disables the timer.
        assert!(config.scheduler.repair_interval().is_none());
        assert!(config.scheduler.fact_refresh_interval().is_none());
        assert_eq!(config.rehearsal.deploy_delay_ms, 25);
        assert_eq!(config.rehearsal.fail.len(), 1);
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = KeelConfig::default();
        config.environment.name = "staging".to_string();
        config.scheduler.repair_interval_secs = Some(3600);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("staging"));
        let back: KeelConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.scheduler.repair_interval_secs, Some(3600));
    }
}
