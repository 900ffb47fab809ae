//! Datacenter configuration.
//!
//! One YAML file configures sources, collection defaults, storage, cache and
//! logging. String fields may reference environment variables with `${NAME}`
//! or `$NAME`; unresolved references become `None`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::core::errors::DatacenterError;

/// Resolve `${NAME}` / `$NAME` references against the environment.
/// Plain strings pass through; unresolved references yield `None`.
pub fn resolve_env_ref(value: &str) -> Option<String> {
    if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        return std::env::var(name).ok();
    }
    if let Some(name) = value.strip_prefix('$') {
        return std::env::var(name).ok();
    }
    Some(value.to_string())
}

/// Per-source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: f64,
    pub retry_count: u32,
    pub retry_delay: f64,
    pub rate_limit: f64,
    pub headers: HashMap<String, String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: String::new(),
            api_key: None,
            timeout: 30.0,
            retry_count: 3,
            retry_delay: 1.0,
            rate_limit: 10.0,
            headers: HashMap::new(),
        }
    }
}

impl SourceSettings {
    /// API key with environment references resolved. Called at request time
    /// so rotated secrets take effect without a restart.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.as_deref().and_then(resolve_env_ref)
    }
}

/// Collection defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub default_start_date: String,
    pub validate_on_collect: bool,
    pub dedup_enabled: bool,
    pub quality_threshold: f64,
    pub max_retries: u32,
    pub retry_delay: f64,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_concurrent: 5,
            default_start_date: "2020-01-01".to_string(),
            validate_on_collect: true,
            dedup_enabled: true,
            quality_threshold: 0.95,
            max_retries: 3,
            retry_delay: 1.0,
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_url: String,
    pub pool_size: u32,
    pub echo_sql: bool,
    pub batch_insert_size: usize,
    pub timezone: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://findata.db".to_string(),
            pool_size: 10,
            echo_sql: false,
            batch_insert_size: 1000,
            timezone: "Asia/Shanghai".to_string(),
        }
    }
}

impl StorageSettings {
    pub fn resolve_database_url(&self) -> String {
        resolve_env_ref(&self.database_url).unwrap_or_else(|| self.database_url.clone())
    }
}

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: String,
    pub ttl: u64,
    pub max_size: usize,
    pub redis_url: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: "memory".to_string(),
            ttl: 300,
            max_size: 10_000,
            redis_url: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
            file: None,
        }
    }
}

/// Complete datacenter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatacenterConfig {
    pub version: String,
    pub sources: HashMap<String, SourceSettings>,
    pub collection: CollectionSettings,
    pub storage: StorageSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

impl DatacenterConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, DatacenterError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DatacenterError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, DatacenterError> {
        let mut config: DatacenterConfig = serde_yaml::from_str(raw)
            .map_err(|e| DatacenterError::configuration(format!("malformed config: {e}")))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `DATACENTER_`-prefixed variables override the hot knobs.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATACENTER_DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Ok(level) = std::env::var("DATACENTER_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceSettings> {
        self.sources.get(source_id)
    }

    pub fn add_source(&mut self, source_id: impl Into<String>, settings: SourceSettings) {
        self.sources.insert(source_id.into(), settings);
    }

    /// Enabled sources only.
    pub fn enabled_sources(&self) -> impl Iterator<Item = (&String, &SourceSettings)> {
        self.sources.iter().filter(|(_, s)| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_refs_resolve_both_syntaxes() {
        std::env::set_var("FINDATA_TEST_KEY", "secret123");
        assert_eq!(
            resolve_env_ref("${FINDATA_TEST_KEY}").as_deref(),
            Some("secret123")
        );
        assert_eq!(
            resolve_env_ref("$FINDATA_TEST_KEY").as_deref(),
            Some("secret123")
        );
        assert_eq!(resolve_env_ref("literal-key").as_deref(), Some("literal-key"));
        assert_eq!(resolve_env_ref("${FINDATA_TEST_MISSING_VAR}"), None);
    }

    #[test]
    fn yaml_parses_with_defaults_for_missing_sections() {
        let yaml = r#"
version: "1.0"
sources:
  eastmoney:
    base_url: "https://push2.example.com"
    rate_limit: 5.0
  jinshi:
    enabled: false
    base_url: "https://news.example.com"
storage:
  database_url: "sqlite://test.db"
"#;
        let config = DatacenterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.sources.len(), 2);

        let em = config.source("eastmoney").unwrap();
        assert!(em.enabled);
        assert_eq!(em.rate_limit, 5.0);
        assert_eq!(em.timeout, 30.0);

        assert_eq!(config.enabled_sources().count(), 1);
        assert_eq!(config.collection.batch_size, 1000);
        assert_eq!(config.storage.database_url, "sqlite://test.db");
    }

    #[test]
    fn malformed_yaml_is_a_configuration_error() {
        let err = DatacenterConfig::from_yaml("sources: [not: a map").unwrap_err();
        assert!(!err.recoverable());
    }

    #[test]
    fn api_key_resolution_is_late_bound() {
        std::env::set_var("FINDATA_ROTATING_KEY", "v1");
        let settings = SourceSettings {
            api_key: Some("${FINDATA_ROTATING_KEY}".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.resolve_api_key().as_deref(), Some("v1"));

        std::env::set_var("FINDATA_ROTATING_KEY", "v2");
        assert_eq!(settings.resolve_api_key().as_deref(), Some("v2"));
    }
}
