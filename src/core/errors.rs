//! Error taxonomy and monitoring.
//!
//! Every failure in the pipeline is categorized (network, validation,
//! transformation, storage, configuration, external, internal) with a
//! severity and a recoverable flag. Recent operation contexts are retained
//! in a bounded ring buffer; alert handlers fire for high/critical errors.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use thiserror::Error;

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Validation,
    Transformation,
    Storage,
    Configuration,
    External,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Transformation => "transformation",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::External => "external",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// Categorized datacenter error.
#[derive(Debug, Clone, Error)]
pub enum DatacenterError {
    #[error("network error: {message}")]
    Network {
        message: String,
        url: Option<String>,
        status: Option<u16>,
    },

    #[error("validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("transformation error: {message}")]
    Transformation { message: String },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        table: Option<String>,
        operation: Option<String>,
    },

    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        key: Option<String>,
    },

    #[error("external service error: {message}")]
    External {
        message: String,
        service: Option<String>,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DatacenterError {
    pub fn network(message: impl Into<String>) -> Self {
        DatacenterError::Network {
            message: message.into(),
            url: None,
            status: None,
        }
    }

    pub fn network_status(message: impl Into<String>, url: impl Into<String>, status: u16) -> Self {
        DatacenterError::Network {
            message: message.into(),
            url: Some(url.into()),
            status: Some(status),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DatacenterError::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DatacenterError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn transformation(message: impl Into<String>) -> Self {
        DatacenterError::Transformation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        DatacenterError::Storage {
            message: message.into(),
            table: None,
            operation: None,
        }
    }

    pub fn storage_table(
        message: impl Into<String>,
        table: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        DatacenterError::Storage {
            message: message.into(),
            table: Some(table.into()),
            operation: Some(operation.into()),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        DatacenterError::Configuration {
            message: message.into(),
            key: None,
        }
    }

    pub fn configuration_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        DatacenterError::Configuration {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    pub fn external(message: impl Into<String>, service: impl Into<String>) -> Self {
        DatacenterError::External {
            message: message.into(),
            service: Some(service.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DatacenterError::Internal {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DatacenterError::Network { .. } => ErrorCategory::Network,
            DatacenterError::Validation { .. } => ErrorCategory::Validation,
            DatacenterError::Transformation { .. } => ErrorCategory::Transformation,
            DatacenterError::Storage { .. } => ErrorCategory::Storage,
            DatacenterError::Configuration { .. } => ErrorCategory::Configuration,
            DatacenterError::External { .. } => ErrorCategory::External,
            DatacenterError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DatacenterError::Validation { .. } => ErrorSeverity::Low,
            DatacenterError::Network { .. } | DatacenterError::Transformation { .. } => {
                ErrorSeverity::Medium
            }
            DatacenterError::Storage { .. }
            | DatacenterError::Configuration { .. }
            | DatacenterError::External { .. }
            | DatacenterError::Internal { .. } => ErrorSeverity::High,
        }
    }

    /// Configuration errors abort startup; everything else is retried or
    /// degraded around.
    pub fn recoverable(&self) -> bool {
        !matches!(self, DatacenterError::Configuration { .. })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "message": self.to_string(),
            "category": self.category().as_str(),
            "severity": self.severity().as_str(),
            "recoverable": self.recoverable(),
        })
    }
}

/// Outcome of one decorated operation, kept for monitoring.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub error: Option<DatacenterError>,
}

impl ErrorContext {
    pub fn duration_ms(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64
    }
}

pub type AlertHandler = Box<dyn Fn(&DatacenterError) + Send + Sync>;

const CONTEXT_BUFFER_CAP: usize = 1000;
const CONTEXT_BUFFER_KEEP: usize = 500;

/// Bounded history of operation outcomes plus alert fan-out.
pub struct ErrorMonitor {
    contexts: Mutex<VecDeque<ErrorContext>>,
    alert_handlers: Mutex<Vec<AlertHandler>>,
}

impl ErrorMonitor {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(VecDeque::new()),
            alert_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn register_alert_handler(&self, handler: AlertHandler) {
        self.alert_handlers.lock().push(handler);
    }

    /// Record a completed operation. High/critical failures notify alert
    /// handlers.
    pub fn record(&self, context: ErrorContext) {
        if let Some(error) = context.error.as_ref().filter(|e| !context.success) {
            match error.severity() {
                ErrorSeverity::Low => {
                    tracing::debug!(category = error.category().as_str(), "{error}")
                }
                ErrorSeverity::Medium => {
                    tracing::warn!(category = error.category().as_str(), "{error}")
                }
                ErrorSeverity::High | ErrorSeverity::Critical => {
                    tracing::error!(category = error.category().as_str(), "{error}");
                    for handler in self.alert_handlers.lock().iter() {
                        handler(error);
                    }
                }
            }
        }

        let mut contexts = self.contexts.lock();
        contexts.push_back(context);
        if contexts.len() > CONTEXT_BUFFER_CAP {
            let overflow = contexts.len() - CONTEXT_BUFFER_KEEP;
            contexts.drain(..overflow);
        }
    }

    /// Convenience wrapper recording an operation outcome.
    pub fn record_operation(
        &self,
        component: &str,
        operation: &str,
        started_at: DateTime<Utc>,
        result: Result<(), DatacenterError>,
    ) {
        let (success, error) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e)),
        };
        self.record(ErrorContext {
            component: component.to_string(),
            operation: operation.to_string(),
            started_at,
            ended_at: Some(Utc::now()),
            success,
            error,
        });
    }

    pub fn statistics(&self) -> Value {
        let contexts = self.contexts.lock();
        let total = contexts.len();
        let mut errors = 0usize;
        let mut by_category: std::collections::HashMap<&'static str, usize> = Default::default();
        let mut by_severity: std::collections::HashMap<&'static str, usize> = Default::default();

        for ctx in contexts.iter().filter(|c| !c.success) {
            errors += 1;
            if let Some(e) = &ctx.error {
                *by_category.entry(e.category().as_str()).or_default() += 1;
                *by_severity.entry(e.severity().as_str()).or_default() += 1;
            }
        }

        json!({
            "total_operations": total,
            "total_errors": errors,
            "error_rate": if total > 0 { errors as f64 / total as f64 } else { 0.0 },
            "by_category": by_category,
            "by_severity": by_severity,
        })
    }

    pub fn clear(&self) {
        self.contexts.lock().clear();
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Health of one component.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub component: String,
    pub healthy: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn healthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            healthy: true,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            healthy: false,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

type HealthCheckFn = Box<dyn Fn() -> HealthStatus + Send + Sync>;

/// Named health checks aggregated into an overall status.
pub struct HealthChecker {
    checks: Mutex<Vec<(String, HealthCheckFn)>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            checks: Mutex::new(Vec::new()),
        }
    }

    pub fn register_check(
        &self,
        name: impl Into<String>,
        check: impl Fn() -> HealthStatus + Send + Sync + 'static,
    ) {
        self.checks.lock().push((name.into(), Box::new(check)));
    }

    pub fn run_checks(&self) -> Vec<HealthStatus> {
        self.checks.lock().iter().map(|(_, check)| check()).collect()
    }

    pub fn overall_health(&self) -> HealthStatus {
        let results = self.run_checks();
        let issues: Vec<&str> = results
            .iter()
            .filter(|s| !s.healthy)
            .map(|s| s.component.as_str())
            .collect();

        if issues.is_empty() {
            HealthStatus::healthy("datacenter", "all systems healthy")
        } else {
            HealthStatus::unhealthy("datacenter", format!("issues: {}", issues.join(", ")))
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn severity_and_recoverability_by_category() {
        assert_eq!(
            DatacenterError::validation("missing").severity(),
            ErrorSeverity::Low
        );
        assert_eq!(
            DatacenterError::network("timeout").severity(),
            ErrorSeverity::Medium
        );
        assert_eq!(
            DatacenterError::storage("deadlock").severity(),
            ErrorSeverity::High
        );
        assert!(!DatacenterError::configuration("bad yaml").recoverable());
        assert!(DatacenterError::network("timeout").recoverable());
    }

    #[test]
    fn alerts_fire_only_for_high_severity() {
        let monitor = ErrorMonitor::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitor.register_alert_handler(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        monitor.record_operation(
            "mapping",
            "apply",
            Utc::now(),
            Err(DatacenterError::validation("low severity")),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        monitor.record_operation(
            "persistence",
            "save",
            Utc::now(),
            Err(DatacenterError::storage("disk full")),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn context_buffer_is_bounded() {
        let monitor = ErrorMonitor::new();
        for _ in 0..1200 {
            monitor.record_operation("http", "get", Utc::now(), Ok(()));
        }
        let stats = monitor.statistics();
        let total = stats["total_operations"].as_u64().unwrap();
        assert!(total <= 1000);
    }

    #[test]
    fn overall_health_reports_failing_components() {
        let checker = HealthChecker::new();
        checker.register_check("db", || HealthStatus::healthy("db", "ok"));
        checker.register_check("http", || HealthStatus::unhealthy("http", "down"));

        let overall = checker.overall_health();
        assert!(!overall.healthy);
        assert!(overall.message.contains("http"));
    }
}
