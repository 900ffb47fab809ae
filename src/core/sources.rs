//! Data source registry with capability declarations and health tracking.
//!
//! Each source advertises what it can serve; rolling health counters feed
//! source selection so degraded providers fall out of rotation.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{DataFrequency, DataType};

/// Source availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Available,
    Degraded,
    Unavailable,
    Unknown,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Available => "available",
            SourceStatus::Degraded => "degraded",
            SourceStatus::Unavailable => "unavailable",
            SourceStatus::Unknown => "unknown",
        }
    }
}

/// What a source can serve.
#[derive(Debug, Clone)]
pub struct SourceCapabilities {
    pub data_types: Vec<DataType>,
    pub frequencies: Vec<DataFrequency>,
    pub supports_realtime: bool,
    pub supports_history: bool,
    pub max_history_days: u32,
    pub rate_limit_per_second: f64,
    pub requires_auth: bool,
}

impl Default for SourceCapabilities {
    fn default() -> Self {
        Self {
            data_types: Vec::new(),
            frequencies: vec![DataFrequency::Daily],
            supports_realtime: false,
            supports_history: true,
            max_history_days: 3650,
            rate_limit_per_second: 10.0,
            requires_auth: false,
        }
    }
}

impl SourceCapabilities {
    pub fn supports(&self, data_type: DataType, frequency: Option<DataFrequency>) -> bool {
        if !self.data_types.contains(&data_type) {
            return false;
        }
        match frequency {
            Some(f) => self.frequencies.contains(&f),
            None => true,
        }
    }
}

/// Transport-level configuration for a registered source.
#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    pub source_id: String,
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout: f64,
    pub retry_count: u32,
}

/// Rolling health counters for one source.
#[derive(Debug, Clone)]
pub struct SourceHealth {
    pub source_id: String,
    pub status: SourceStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
}

impl SourceHealth {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            status: SourceStatus::Unknown,
            last_check: None,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            total_requests: 0,
            success_count: 0,
            error_count: 0,
            avg_response_time_ms: 0.0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.total_requests as f64
    }

    pub fn record_success(&mut self, response_time_ms: f64) {
        self.last_success = Some(Utc::now());
        self.consecutive_failures = 0;
        self.total_requests += 1;
        self.success_count += 1;
        self.fold_response_time(response_time_ms);
        self.update_status();
    }

    pub fn record_failure(&mut self) {
        self.last_failure = Some(Utc::now());
        self.consecutive_failures += 1;
        self.total_requests += 1;
        self.error_count += 1;
        self.update_status();
    }

    fn fold_response_time(&mut self, response_time_ms: f64) {
        if self.total_requests <= 1 {
            self.avg_response_time_ms = response_time_ms;
        } else {
            let n = self.total_requests as f64;
            self.avg_response_time_ms =
                (self.avg_response_time_ms * (n - 1.0) + response_time_ms) / n;
        }
    }

    fn update_status(&mut self) {
        self.status = if self.consecutive_failures >= 5 {
            SourceStatus::Unavailable
        } else if self.consecutive_failures >= 2 || self.success_rate() < 0.5 {
            SourceStatus::Degraded
        } else {
            SourceStatus::Available
        };
    }
}

struct SourceEntry {
    config: SourceConfig,
    capabilities: Option<SourceCapabilities>,
    health: Arc<Mutex<SourceHealth>>,
}

/// Central registry mapping source ids to config, capabilities and health.
///
/// Registration is idempotent: re-registering replaces the config and resets
/// health counters.
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, SourceEntry>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, config: SourceConfig, capabilities: Option<SourceCapabilities>) {
        let source_id = config.source_id.clone();
        let entry = SourceEntry {
            health: Arc::new(Mutex::new(SourceHealth::new(&source_id))),
            config,
            capabilities,
        };
        self.sources.write().insert(source_id, entry);
    }

    pub fn config(&self, source_id: &str) -> Option<SourceConfig> {
        self.sources
            .read()
            .get(source_id)
            .map(|e| e.config.clone())
    }

    pub fn capabilities(&self, source_id: &str) -> Option<SourceCapabilities> {
        self.sources
            .read()
            .get(source_id)
            .and_then(|e| e.capabilities.clone())
    }

    pub fn health(&self, source_id: &str) -> Option<SourceHealth> {
        self.sources
            .read()
            .get(source_id)
            .map(|e| e.health.lock().clone())
    }

    /// Rank available sources for a data type and pick the best.
    ///
    /// Score: +100 for a realtime match when preferred, + success rate × 50,
    /// − consecutive failures × 10. Unavailable sources are excluded.
    pub fn select_source(
        &self,
        data_type: DataType,
        frequency: Option<DataFrequency>,
        prefer_realtime: bool,
    ) -> Option<String> {
        let sources = self.sources.read();
        let mut candidates: Vec<(&String, i64)> = Vec::new();

        for (source_id, entry) in sources.iter() {
            let Some(caps) = &entry.capabilities else {
                continue;
            };
            if !caps.supports(data_type, frequency) {
                continue;
            }

            let health = entry.health.lock();
            if health.status == SourceStatus::Unavailable {
                continue;
            }

            let mut score: i64 = 0;
            if prefer_realtime && caps.supports_realtime {
                score += 100;
            }
            score += (health.success_rate() * 50.0) as i64;
            score -= health.consecutive_failures as i64 * 10;
            candidates.push((source_id, score));
        }

        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        candidates.first().map(|(id, _)| (*id).clone())
    }

    pub fn record_success(&self, source_id: &str, response_time_ms: f64) {
        if let Some(entry) = self.sources.read().get(source_id) {
            entry.health.lock().record_success(response_time_ms);
        }
    }

    pub fn record_failure(&self, source_id: &str) {
        if let Some(entry) = self.sources.read().get(source_id) {
            entry.health.lock().record_failure();
        }
    }

    pub fn list_sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn list_available_sources(&self) -> Vec<String> {
        let sources = self.sources.read();
        let mut ids: Vec<String> = sources
            .iter()
            .filter(|(_, e)| e.health.lock().status != SourceStatus::Unavailable)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn summary(&self) -> Value {
        let sources = self.sources.read();
        let per_source: HashMap<String, Value> = sources
            .iter()
            .map(|(id, entry)| {
                let health = entry.health.lock();
                (
                    id.clone(),
                    json!({
                        "name": entry.config.name,
                        "status": health.status.as_str(),
                        "success_rate": health.success_rate(),
                        "avg_response_time_ms": health.avg_response_time_ms,
                    }),
                )
            })
            .collect();

        json!({
            "total_sources": sources.len(),
            "available_sources": self.list_available_sources().len(),
            "sources": per_source,
        })
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote_source(id: &str, realtime: bool) -> (SourceConfig, SourceCapabilities) {
        (
            SourceConfig {
                source_id: id.to_string(),
                name: id.to_string(),
                ..Default::default()
            },
            SourceCapabilities {
                data_types: vec![DataType::StockQuote],
                supports_realtime: realtime,
                ..Default::default()
            },
        )
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut health = SourceHealth::new("eastmoney");
        health.record_failure();
        health.record_failure();
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.status, SourceStatus::Degraded);

        health.record_success(20.0);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn five_consecutive_failures_mark_unavailable() {
        let mut health = SourceHealth::new("eastmoney");
        for _ in 0..4 {
            health.record_failure();
        }
        assert_ne!(health.status, SourceStatus::Unavailable);
        health.record_failure();
        assert_eq!(health.status, SourceStatus::Unavailable);
    }

    #[test]
    fn low_success_rate_degrades() {
        let mut health = SourceHealth::new("eastmoney");
        health.record_failure();
        health.record_success(10.0);
        // 1 of 2 succeeded; rate not below 0.5, one success resets streak.
        assert_eq!(health.status, SourceStatus::Available);

        health.record_failure();
        health.record_failure();
        health.record_success(10.0);
        // 2/5 success rate < 0.5.
        assert_eq!(health.status, SourceStatus::Degraded);
    }

    #[test]
    fn rolling_mean_response_time() {
        let mut health = SourceHealth::new("eastmoney");
        health.record_success(10.0);
        health.record_success(30.0);
        assert!((health.avg_response_time_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn selection_prefers_realtime_when_asked() {
        let registry = SourceRegistry::new();
        let (config, caps) = quote_source("slowpoke", false);
        registry.register(config, Some(caps));
        let (config, caps) = quote_source("ticker", true);
        registry.register(config, Some(caps));

        assert_eq!(
            registry.select_source(DataType::StockQuote, None, true),
            Some("ticker".to_string())
        );
    }

    #[test]
    fn selection_skips_unavailable_sources() {
        let registry = SourceRegistry::new();
        let (config, caps) = quote_source("flaky", true);
        registry.register(config, Some(caps));
        let (config, caps) = quote_source("steady", false);
        registry.register(config, Some(caps));

        for _ in 0..5 {
            registry.record_failure("flaky");
        }
        assert_eq!(
            registry.select_source(DataType::StockQuote, None, true),
            Some("steady".to_string())
        );
        assert_eq!(registry.list_available_sources(), vec!["steady"]);
    }

    #[test]
    fn selection_returns_none_without_candidates() {
        let registry = SourceRegistry::new();
        assert_eq!(registry.select_source(DataType::StockQuote, None, false), None);
    }

    #[test]
    fn reregistration_resets_health() {
        let registry = SourceRegistry::new();
        let (config, caps) = quote_source("eastmoney", true);
        registry.register(config.clone(), Some(caps.clone()));
        for _ in 0..5 {
            registry.record_failure("eastmoney");
        }
        assert_eq!(
            registry.health("eastmoney").unwrap().status,
            SourceStatus::Unavailable
        );

        registry.register(config, Some(caps));
        assert_eq!(
            registry.health("eastmoney").unwrap().status,
            SourceStatus::Unknown
        );
    }
}
