//! Task registry: self-describing collection tasks with progress tracking.
//!
//! A task executor runs a three-stage pipeline (collect → validate → save)
//! under a per-task timeout. The registry keys executors by task type and
//! surfaces their metadata as the programmatic task API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::core::errors::DatacenterError;
use crate::models::{CollectParams, Record};

/// Categories for task organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Market,
    Fundamental,
    News,
    Macro,
    Derivative,
    Knowledge,
}

impl TaskCategory {
    pub fn all() -> [TaskCategory; 6] {
        [
            TaskCategory::Market,
            TaskCategory::Fundamental,
            TaskCategory::News,
            TaskCategory::Macro,
            TaskCategory::Derivative,
            TaskCategory::Knowledge,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Market => "market",
            TaskCategory::Fundamental => "fundamental",
            TaskCategory::News => "news",
            TaskCategory::Macro => "macro",
            TaskCategory::Derivative => "derivative",
            TaskCategory::Knowledge => "knowledge",
        }
    }
}

/// Priority levels; lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

/// Declared parameter of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub choices: Option<Vec<String>>,
}

impl TaskParameter {
    pub fn new(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            default: None,
            required: false,
            description: String::new(),
            choices: None,
        }
    }

    pub fn default_value(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = Some(choices.iter().map(|c| c.to_string()).collect());
        self
    }
}

/// What a task produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub data_type: String,
    pub table_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Metadata describing one task type.
#[derive(Debug, Clone)]
pub struct TaskMetadata {
    pub task_type: String,
    pub name: String,
    pub description: String,
    pub category: TaskCategory,
    pub priority: TaskPriority,
    pub source: String,
    pub timeout: Duration,
    pub retry_count: u32,
    pub parameters: Vec<TaskParameter>,
    pub output: Option<TaskOutput>,
    pub tags: Vec<String>,
    pub version: String,
}

impl TaskMetadata {
    pub fn new(
        task_type: impl Into<String>,
        name: impl Into<String>,
        category: TaskCategory,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            name: name.into(),
            description: String::new(),
            category,
            priority: TaskPriority::Normal,
            source: String::new(),
            timeout: Duration::from_secs(300),
            retry_count: 3,
            parameters: Vec::new(),
            output: None,
            tags: Vec::new(),
            version: "1.0.0".to_string(),
        }
    }

    /// Validate a parameter bag against the declared schema: required
    /// params must be present, choice params must hold a listed value, and
    /// declared defaults fill the gaps.
    pub fn validate_params(&self, params: &CollectParams) -> Result<CollectParams, DatacenterError> {
        let mut validated: Map<String, Value> = params.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for parameter in &self.parameters {
            match validated.get(&parameter.name) {
                None | Some(Value::Null) => {
                    if let Some(default) = &parameter.default {
                        validated.insert(parameter.name.clone(), default.clone());
                    } else if parameter.required {
                        return Err(DatacenterError::validation_field(
                            format!("missing required parameter '{}'", parameter.name),
                            parameter.name.clone(),
                        ));
                    }
                }
                Some(value) => {
                    if let Some(choices) = &parameter.choices {
                        let rendered = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        if !choices.contains(&rendered) {
                            return Err(DatacenterError::validation_field(
                                format!(
                                    "parameter '{}' must be one of {choices:?}, got {rendered}",
                                    parameter.name
                                ),
                                parameter.name.clone(),
                            ));
                        }
                    }
                }
            }
        }

        Ok(CollectParams::from(validated))
    }
}

/// Execution stage of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Collecting,
    Validating,
    Saving,
    Completed,
    Failed,
}

/// Mutable progress record for one task run. Counts are monotonic.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_records: usize,
    pub processed_records: usize,
    pub saved_records: usize,
    pub error_message: Option<String>,
    pub details: Map<String, Value>,
}

impl TaskProgress {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            total_records: 0,
            processed_records: 0,
            saved_records: 0,
            error_message: None,
            details: Map::new(),
        }
    }

    pub fn progress_pct(&self) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        (self.processed_records as f64 / self.total_records as f64 * 100.0).min(100.0)
    }

    pub fn duration(&self) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - started).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Shared handle onto a task's progress. Setters for counters only ever
/// increase them within a run.
#[derive(Clone)]
pub struct ProgressHandle(Arc<Mutex<TaskProgress>>);

impl ProgressHandle {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(TaskProgress::new(task_id))))
    }

    pub fn snapshot(&self) -> TaskProgress {
        self.0.lock().clone()
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.0.lock().status = status;
    }

    pub fn mark_started(&self) {
        let mut progress = self.0.lock();
        progress.status = TaskStatus::Running;
        progress.started_at = Some(Utc::now());
    }

    pub fn set_total(&self, total: usize) {
        let mut progress = self.0.lock();
        progress.total_records = progress.total_records.max(total);
    }

    pub fn set_processed(&self, processed: usize) {
        let mut progress = self.0.lock();
        progress.processed_records = progress.processed_records.max(processed);
    }

    pub fn set_saved(&self, saved: usize) {
        let mut progress = self.0.lock();
        progress.saved_records = progress.saved_records.max(saved);
    }

    pub fn set_detail(&self, key: impl Into<String>, value: Value) {
        self.0.lock().details.insert(key.into(), value);
    }

    pub fn mark_completed(&self) {
        let mut progress = self.0.lock();
        progress.status = TaskStatus::Completed;
        progress.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&self, message: impl Into<String>) {
        let mut progress = self.0.lock();
        progress.status = TaskStatus::Failed;
        progress.error_message = Some(message.into());
        progress.completed_at = Some(Utc::now());
    }
}

/// Result summary returned by `execute`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRunSummary {
    pub success: bool,
    pub task_type: String,
    pub records_collected: usize,
    pub records_validated: usize,
    pub records_saved: usize,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

/// A collection task: three overridable stages plus the provided pipeline.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn metadata(&self) -> &TaskMetadata;

    async fn collect(
        &self,
        params: &CollectParams,
        progress: &ProgressHandle,
    ) -> Result<Vec<Record>, DatacenterError>;

    async fn validate(&self, records: Vec<Record>) -> Result<Vec<Record>, DatacenterError>;

    async fn save(
        &self,
        records: Vec<Record>,
        progress: &ProgressHandle,
    ) -> Result<usize, DatacenterError>;

    /// Run the full pipeline under the task timeout.
    async fn execute(&self, params: &CollectParams, progress: &ProgressHandle) -> TaskRunSummary {
        let metadata = self.metadata();
        progress.mark_started();

        let pipeline = self.run_pipeline(params, progress);
        let outcome = match tokio::time::timeout(metadata.timeout, pipeline).await {
            Ok(result) => result,
            Err(_) => Err(DatacenterError::internal(format!(
                "task timed out after {:.0}s",
                metadata.timeout.as_secs_f64()
            ))),
        };

        match outcome {
            Ok((collected, validated, saved)) => {
                progress.mark_completed();
                let duration = progress.snapshot().duration().as_secs_f64();
                info!(
                    task_type = metadata.task_type,
                    collected, validated, saved, "task completed"
                );
                TaskRunSummary {
                    success: true,
                    task_type: metadata.task_type.clone(),
                    records_collected: collected,
                    records_validated: validated,
                    records_saved: saved,
                    duration_seconds: duration,
                    error: None,
                }
            }
            Err(e) => {
                progress.mark_failed(e.to_string());
                let duration = progress.snapshot().duration().as_secs_f64();
                error!(task_type = metadata.task_type, "task failed: {e}");
                TaskRunSummary {
                    success: false,
                    task_type: metadata.task_type.clone(),
                    records_collected: 0,
                    records_validated: 0,
                    records_saved: 0,
                    duration_seconds: duration,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    #[doc(hidden)]
    async fn run_pipeline(
        &self,
        params: &CollectParams,
        progress: &ProgressHandle,
    ) -> Result<(usize, usize, usize), DatacenterError> {
        progress.set_status(TaskStatus::Collecting);
        let records = self.collect(params, progress).await?;
        let collected = records.len();
        progress.set_total(collected);
        progress.set_processed(collected);

        progress.set_status(TaskStatus::Validating);
        let validated = self.validate(records).await?;
        let validated_count = validated.len();

        progress.set_status(TaskStatus::Saving);
        let saved = self.save(validated, progress).await?;
        progress.set_saved(saved);

        Ok((collected, validated_count, saved))
    }
}

/// Process-wide task registry.
pub struct TaskRegistry {
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, executor: Arc<dyn TaskExecutor>) {
        let metadata = executor.metadata().clone();
        info!(
            task_type = metadata.task_type,
            name = metadata.name,
            "registered task"
        );
        self.executors
            .write()
            .insert(metadata.task_type, executor);
    }

    pub fn executor(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.read().get(task_type).cloned()
    }

    pub fn metadata(&self, task_type: &str) -> Option<TaskMetadata> {
        self.executors
            .read()
            .get(task_type)
            .map(|e| e.metadata().clone())
    }

    /// All registered tasks sorted by (priority, name), optionally filtered
    /// by category.
    pub fn list_tasks(&self, category: Option<TaskCategory>) -> Vec<TaskMetadata> {
        let mut tasks: Vec<TaskMetadata> = self
            .executors
            .read()
            .values()
            .map(|e| e.metadata().clone())
            .filter(|m| category.map(|c| m.category == c).unwrap_or(true))
            .collect();
        tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        tasks
    }

    /// Task counts per category.
    pub fn list_categories(&self) -> HashMap<TaskCategory, usize> {
        let mut counts = HashMap::new();
        for executor in self.executors.read().values() {
            *counts.entry(executor.metadata().category).or_insert(0) += 1;
        }
        counts
    }

    /// JSON schema for one task, used by the programmatic API surface.
    pub fn task_info(&self, task_type: &str) -> Option<Value> {
        let metadata = self.metadata(task_type)?;
        Some(json!({
            "task_type": metadata.task_type,
            "name": metadata.name,
            "description": metadata.description,
            "category": metadata.category.as_str(),
            "priority": metadata.priority as u8,
            "source": metadata.source,
            "timeout": metadata.timeout.as_secs_f64(),
            "retry_count": metadata.retry_count,
            "parameters": metadata.parameters.iter().map(|p| json!({
                "name": p.name,
                "type": p.param_type,
                "default": p.default,
                "required": p.required,
                "description": p.description,
                "choices": p.choices,
            })).collect::<Vec<_>>(),
            "output": metadata.output.as_ref().map(|o| json!({
                "data_type": o.data_type,
                "table_name": o.table_name,
                "description": o.description,
                "fields": o.fields,
            })),
            "tags": metadata.tags,
            "version": metadata.version,
        }))
    }

    pub fn all_task_info(&self) -> Vec<Value> {
        self.list_tasks(None)
            .iter()
            .filter_map(|m| self.task_info(&m.task_type))
            .collect()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubTask {
        metadata: TaskMetadata,
        fail_collect: AtomicBool,
        records: usize,
    }

    impl StubTask {
        fn new(task_type: &str, category: TaskCategory, priority: TaskPriority) -> Self {
            let mut metadata = TaskMetadata::new(task_type, task_type, category);
            metadata.priority = priority;
            Self {
                metadata,
                fail_collect: AtomicBool::new(false),
                records: 4,
            }
        }
    }

    #[async_trait]
    impl TaskExecutor for StubTask {
        fn metadata(&self) -> &TaskMetadata {
            &self.metadata
        }

        async fn collect(
            &self,
            _params: &CollectParams,
            _progress: &ProgressHandle,
        ) -> Result<Vec<Record>, DatacenterError> {
            if self.fail_collect.load(Ordering::SeqCst) {
                return Err(DatacenterError::network("collect blew up"));
            }
            Ok((0..self.records)
                .map(|i| {
                    let mut r = Record::new();
                    r.insert("code".to_string(), json!(format!("{i:06}")));
                    r
                })
                .collect())
        }

        async fn validate(&self, records: Vec<Record>) -> Result<Vec<Record>, DatacenterError> {
            // Drop one record to exercise the valid < collected path.
            Ok(records.into_iter().skip(1).collect())
        }

        async fn save(
            &self,
            records: Vec<Record>,
            _progress: &ProgressHandle,
        ) -> Result<usize, DatacenterError> {
            Ok(records.len())
        }
    }

    #[tokio::test]
    async fn pipeline_runs_all_stages_and_reports_counts() {
        let task = StubTask::new("stub", TaskCategory::Market, TaskPriority::Normal);
        let progress = ProgressHandle::new("run-1");

        let summary = task.execute(&CollectParams::new(), &progress).await;
        assert!(summary.success);
        assert_eq!(summary.records_collected, 4);
        assert_eq!(summary.records_validated, 3);
        assert_eq!(summary.records_saved, 3);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert!(snapshot.completed_at.is_some());
        assert_eq!(snapshot.total_records, 4);
        assert_eq!(snapshot.saved_records, 3);
        assert!(snapshot.saved_records <= snapshot.processed_records);
        assert!(snapshot.processed_records <= snapshot.total_records);
    }

    #[tokio::test]
    async fn failures_mark_progress_failed() {
        let task = StubTask::new("stub", TaskCategory::Market, TaskPriority::Normal);
        task.fail_collect.store(true, Ordering::SeqCst);
        let progress = ProgressHandle::new("run-2");

        let summary = task.execute(&CollectParams::new(), &progress).await;
        assert!(!summary.success);
        assert!(summary.error.unwrap().contains("blew up"));

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert!(snapshot.error_message.is_some());
        assert!(snapshot.completed_at.is_some());
    }

    #[tokio::test]
    async fn timeout_fails_the_run() {
        struct SlowTask {
            metadata: TaskMetadata,
        }

        #[async_trait]
        impl TaskExecutor for SlowTask {
            fn metadata(&self) -> &TaskMetadata {
                &self.metadata
            }

            async fn collect(
                &self,
                _params: &CollectParams,
                _progress: &ProgressHandle,
            ) -> Result<Vec<Record>, DatacenterError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Vec::new())
            }

            async fn validate(&self, records: Vec<Record>) -> Result<Vec<Record>, DatacenterError> {
                Ok(records)
            }

            async fn save(
                &self,
                _records: Vec<Record>,
                _progress: &ProgressHandle,
            ) -> Result<usize, DatacenterError> {
                Ok(0)
            }
        }

        let mut metadata = TaskMetadata::new("slow", "slow", TaskCategory::Market);
        metadata.timeout = Duration::from_millis(50);
        let task = SlowTask { metadata };
        let progress = ProgressHandle::new("run-3");

        let summary = task.execute(&CollectParams::new(), &progress).await;
        assert!(!summary.success);
        assert!(summary.error.unwrap().contains("timed out"));
        assert_eq!(progress.snapshot().status, TaskStatus::Failed);
    }

    #[test]
    fn progress_counters_never_decrease() {
        let progress = ProgressHandle::new("run-4");
        progress.set_processed(10);
        progress.set_processed(5);
        assert_eq!(progress.snapshot().processed_records, 10);
    }

    #[test]
    fn registry_sorts_by_priority_then_name() {
        let registry = TaskRegistry::new();
        registry.register(Arc::new(StubTask::new(
            "zeta",
            TaskCategory::Market,
            TaskPriority::Critical,
        )));
        registry.register(Arc::new(StubTask::new(
            "alpha",
            TaskCategory::News,
            TaskPriority::Normal,
        )));
        registry.register(Arc::new(StubTask::new(
            "beta",
            TaskCategory::Market,
            TaskPriority::Normal,
        )));

        let tasks = registry.list_tasks(None);
        let names: Vec<&str> = tasks.iter().map(|t| t.task_type.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "beta"]);

        let market = registry.list_tasks(Some(TaskCategory::Market));
        assert_eq!(market.len(), 2);

        let categories = registry.list_categories();
        assert_eq!(categories[&TaskCategory::Market], 2);
        assert_eq!(categories[&TaskCategory::News], 1);
    }

    #[test]
    fn parameter_validation_applies_defaults_and_choices() {
        let mut metadata = TaskMetadata::new("t", "t", TaskCategory::Market);
        metadata.parameters = vec![
            TaskParameter::new("market", "string")
                .default_value(json!("沪深A"))
                .choices(&["沪深A", "上证A", "深证A"]),
            TaskParameter::new("codes", "array").required(),
        ];

        let params = CollectParams::new().with("codes", json!(["600000"]));
        let validated = metadata.validate_params(&params).unwrap();
        assert_eq!(validated.get_string("market").unwrap(), "沪深A");

        let missing = metadata.validate_params(&CollectParams::new());
        assert!(missing.is_err());

        let bad_choice = CollectParams::new()
            .with("codes", json!([]))
            .with("market", "nasdaq");
        assert!(metadata.validate_params(&bad_choice).is_err());
    }

    #[test]
    fn task_info_exposes_the_schema() {
        let registry = TaskRegistry::new();
        let mut task = StubTask::new("quotes", TaskCategory::Market, TaskPriority::High);
        task.metadata.output = Some(TaskOutput {
            data_type: "stock_quote".to_string(),
            table_name: "stock_daily_quote".to_string(),
            description: String::new(),
            fields: vec!["code".to_string()],
        });
        registry.register(Arc::new(task));

        let info = registry.task_info("quotes").unwrap();
        assert_eq!(info["priority"], 1);
        assert_eq!(info["output"]["table_name"], "stock_daily_quote");
        assert!(registry.task_info("missing").is_none());
    }
}
