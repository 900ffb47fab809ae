//! Collector harness: lifecycle, retry, dedup and validation.
//!
//! Concrete collectors implement [`RecordFetcher`]; the [`Collector`] wrapper
//! supplies everything else. Collect runs on one collector are serialized by
//! an async run lock, so overlapping schedules cannot interleave.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::core::errors::DatacenterError;
use crate::models::{CollectParams, DataCategory, DataFrequency, DataSource, DataType, Record};

/// Status of a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Configuration shared by every collector.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    pub source: DataSource,
    pub data_type: DataType,
    pub category: DataCategory,
    pub frequency: DataFrequency,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub batch_size: usize,
    pub rate_limit_per_minute: u32,
    pub enable_deduplication: bool,
    pub enable_validation: bool,
    pub symbols: Vec<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub incremental: bool,
    pub extra_params: Map<String, Value>,
}

impl CollectionConfig {
    pub fn new(source: DataSource, data_type: DataType) -> Self {
        Self {
            source,
            data_type,
            category: DataCategory::Market,
            frequency: DataFrequency::Daily,
            timeout: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            batch_size: 100,
            rate_limit_per_minute: 60,
            enable_deduplication: true,
            enable_validation: true,
            symbols: Vec::new(),
            start_date: None,
            end_date: None,
            incremental: false,
            extra_params: Map::new(),
        }
    }
}

/// Outcome of one collection run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectionResult {
    pub task_id: String,
    pub source: DataSource,
    pub status: CollectionStatus,
    pub records_collected: usize,
    pub records_valid: usize,
    pub records_deduplicated: usize,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    #[serde(skip)]
    pub data: Vec<Record>,
}

/// Hash of the given key fields, concatenated in declared order.
/// Null and absent values both render as the empty string so hashing stays
/// deterministic across feeds that mix the two.
pub fn record_hash_for_keys(record: &Record, keys: &[String]) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        match record.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => hasher.update(s.as_bytes()),
            Some(other) => hasher.update(other.to_string().as_bytes()),
        }
        hasher.update([0x1f]); // field separator
    }
    hex::encode(hasher.finalize())
}

/// The part of a collector that differs per source: fetch raw records plus
/// the hooks the harness needs for dedup and validation.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch(&self, params: &CollectParams) -> Result<Vec<Record>, DatacenterError>;

    async fn initialize(&self) -> Result<(), DatacenterError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), DatacenterError> {
        Ok(())
    }

    fn record_hash(&self, record: &Record) -> String;

    fn is_valid(&self, record: &Record) -> bool;
}

/// Generic collector: lifecycle + retry + dedup + validation around a
/// [`RecordFetcher`].
pub struct Collector<F: RecordFetcher> {
    fetcher: F,
    config: CollectionConfig,
    running: AtomicBool,
    run_lock: tokio::sync::Mutex<()>,
    collection_count: AtomicU64,
    error_count: AtomicU64,
    last_collection: Mutex<Option<DateTime<Utc>>>,
}

impl<F: RecordFetcher> Collector<F> {
    pub fn new(fetcher: F, config: CollectionConfig) -> Self {
        Self {
            fetcher,
            config,
            running: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
            collection_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_collection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn source(&self) -> DataSource {
        self.config.source
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn start(&self) -> Result<(), DatacenterError> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(source = %self.config.source, "collector is already running");
            return Ok(());
        }
        info!(source = %self.config.source, "started collector");
        if let Err(e) = self.fetcher.initialize().await {
            self.running.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DatacenterError> {
        self.running.store(false, Ordering::Release);
        info!(source = %self.config.source, "stopped collector");
        self.fetcher.cleanup().await
    }

    pub fn health_check(&self) -> Value {
        let collections = self.collection_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        json!({
            "source": self.config.source.as_str(),
            "is_running": self.is_running(),
            "last_collection": self.last_collection.lock().as_ref().map(|t| t.to_rfc3339()),
            "collection_count": collections,
            "error_count": errors,
            "error_rate": errors as f64 / collections.max(1) as f64,
        })
    }

    /// Run one collection. Failures are captured in the result rather than
    /// propagated; the caller inspects `status`.
    pub async fn collect(&self, params: &CollectParams) -> CollectionResult {
        let task_id = format!(
            "{}_{}",
            self.config.source.as_str(),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let started_at = Utc::now();

        let _run_guard = self.run_lock.lock().await;

        match self.collect_inner(params).await {
            Ok((records, deduplicated, collected)) => {
                self.collection_count.fetch_add(1, Ordering::Relaxed);
                *self.last_collection.lock() = Some(Utc::now());

                let completed_at = Utc::now();
                CollectionResult {
                    task_id,
                    source: self.config.source,
                    status: CollectionStatus::Completed,
                    records_collected: collected,
                    records_valid: records.len(),
                    records_deduplicated: deduplicated,
                    error_message: None,
                    started_at,
                    completed_at: Some(completed_at),
                    duration_seconds: Some(
                        (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
                    ),
                    data: records,
                }
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(source = %self.config.source, "collection failed: {e}");
                CollectionResult {
                    task_id,
                    source: self.config.source,
                    status: CollectionStatus::Failed,
                    records_collected: 0,
                    records_valid: 0,
                    records_deduplicated: 0,
                    error_message: Some(e.to_string()),
                    started_at,
                    completed_at: Some(Utc::now()),
                    duration_seconds: None,
                    data: Vec::new(),
                }
            }
        }
    }

    async fn collect_inner(
        &self,
        params: &CollectParams,
    ) -> Result<(Vec<Record>, usize, usize), DatacenterError> {
        let records = self.fetch_with_retry(params).await?;
        let collected = records.len();

        let (records, deduplicated) = if self.config.enable_deduplication {
            self.deduplicate(records)
        } else {
            (records, 0)
        };

        let records = if self.config.enable_validation {
            self.validate(records)
        } else {
            records
        };

        Ok((records, deduplicated, collected))
    }

    async fn fetch_with_retry(
        &self,
        params: &CollectParams,
    ) -> Result<Vec<Record>, DatacenterError> {
        let mut last_error: Option<DatacenterError> = None;

        for attempt in 0..self.config.retry_count.max(1) {
            match self.fetcher.fetch(params).await {
                Ok(records) => return Ok(records),
                Err(e) => {
                    if attempt + 1 < self.config.retry_count.max(1) {
                        let delay = Duration::from_secs_f64(
                            self.config.retry_delay.as_secs_f64() * 2f64.powi(attempt as i32),
                        );
                        warn!(
                            source = %self.config.source,
                            attempt = attempt + 1,
                            "collection attempt failed, retrying in {:.1}s: {e}",
                            delay.as_secs_f64()
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DatacenterError::internal("collection failed")))
    }

    /// Order-stable dedup: the first occurrence of each hash wins.
    fn deduplicate(&self, records: Vec<Record>) -> (Vec<Record>, usize) {
        let total = records.len();
        let mut seen: HashSet<String> = HashSet::with_capacity(total);
        let unique: Vec<Record> = records
            .into_iter()
            .filter(|record| seen.insert(self.fetcher.record_hash(record)))
            .collect();

        let removed = total - unique.len();
        if removed > 0 {
            info!(
                source = %self.config.source,
                "deduplication removed {removed} duplicates from {total} records"
            );
        }
        (unique, removed)
    }

    fn validate(&self, records: Vec<Record>) -> Vec<Record> {
        let total = records.len();
        let valid: Vec<Record> = records
            .into_iter()
            .filter(|record| self.fetcher.is_valid(record))
            .collect();

        let removed = total - valid.len();
        if removed > 0 {
            info!(
                source = %self.config.source,
                "validation filtered {removed} invalid records from {total} records"
            );
        }
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn record(code: &str, date: &str) -> Record {
        let mut r = Record::new();
        r.insert("code".to_string(), json!(code));
        r.insert("trade_date".to_string(), json!(date));
        r
    }

    struct StubFetcher {
        records: Vec<Record>,
        fail_times: AtomicU32,
    }

    impl StubFetcher {
        fn new(records: Vec<Record>) -> Self {
            Self {
                records,
                fail_times: AtomicU32::new(0),
            }
        }

        fn failing(records: Vec<Record>, failures: u32) -> Self {
            Self {
                records,
                fail_times: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl RecordFetcher for StubFetcher {
        async fn fetch(&self, _params: &CollectParams) -> Result<Vec<Record>, DatacenterError> {
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(DatacenterError::network("boom"));
            }
            Ok(self.records.clone())
        }

        fn record_hash(&self, record: &Record) -> String {
            record_hash_for_keys(
                record,
                &["code".to_string(), "trade_date".to_string()],
            )
        }

        fn is_valid(&self, record: &Record) -> bool {
            record
                .get("trade_date")
                .map(|v| !v.is_null())
                .unwrap_or(false)
        }
    }

    fn collector(fetcher: StubFetcher) -> Collector<StubFetcher> {
        let mut config = CollectionConfig::new(DataSource::Eastmoney, DataType::StockQuote);
        config.retry_delay = Duration::from_millis(10);
        Collector::new(fetcher, config)
    }

    #[tokio::test]
    async fn dedup_keeps_first_occurrence() {
        // Records 1, 3, 5 (indices 0, 2, 4) share one key.
        let mut dup1 = record("000001", "2024-06-03");
        dup1.insert("marker".to_string(), json!("first"));
        let mut dup2 = record("000001", "2024-06-03");
        dup2.insert("marker".to_string(), json!("second"));
        let mut dup3 = record("000001", "2024-06-03");
        dup3.insert("marker".to_string(), json!("third"));

        let records = vec![
            dup1,
            record("600000", "2024-06-03"),
            dup2,
            record("600519", "2024-06-03"),
            dup3,
        ];

        let collector = collector(StubFetcher::new(records));
        let result = collector.collect(&CollectParams::new()).await;

        assert_eq!(result.status, CollectionStatus::Completed);
        assert_eq!(result.records_collected, 5);
        assert_eq!(result.records_deduplicated, 2);
        assert_eq!(result.data.len(), 3);
        // The retained duplicate is the one at the original index 0.
        assert_eq!(result.data[0].get("marker").unwrap(), "first");
    }

    #[tokio::test]
    async fn validation_drops_null_required_fields() {
        let mut bad = record("600000", "2024-06-03");
        bad.insert("trade_date".to_string(), Value::Null);

        let records = vec![
            record("000001", "2024-06-03"),
            bad,
            record("600519", "2024-06-03"),
            record("601318", "2024-06-03"),
        ];

        let collector = collector(StubFetcher::new(records));
        let result = collector.collect(&CollectParams::new()).await;

        assert_eq!(result.status, CollectionStatus::Completed);
        assert_eq!(result.records_collected, 4);
        assert_eq!(result.records_valid, 3);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let collector = collector(StubFetcher::failing(
            vec![record("600000", "2024-06-03")],
            2,
        ));
        let result = collector.collect(&CollectParams::new()).await;
        assert_eq!(result.status, CollectionStatus::Completed);
        assert_eq!(result.records_valid, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let collector = collector(StubFetcher::failing(Vec::new(), 10));
        let result = collector.collect(&CollectParams::new()).await;
        assert_eq!(result.status, CollectionStatus::Failed);
        assert!(result.error_message.unwrap().contains("boom"));

        let health = collector.health_check();
        assert_eq!(health["error_count"], 1);
    }

    #[tokio::test]
    async fn task_ids_carry_source_prefix() {
        let collector = collector(StubFetcher::new(Vec::new()));
        let result = collector.collect(&CollectParams::new()).await;
        assert!(result.task_id.starts_with("eastmoney_"));
    }

    #[tokio::test]
    async fn lifecycle_flags() {
        let collector = collector(StubFetcher::new(Vec::new()));
        assert!(!collector.is_running());
        collector.start().await.unwrap();
        assert!(collector.is_running());
        collector.stop().await.unwrap();
        assert!(!collector.is_running());
    }

    #[test]
    fn record_hash_treats_null_as_absent() {
        let mut with_null = record("600000", "2024-06-03");
        with_null.insert("extra".to_string(), Value::Null);
        let without = record("600000", "2024-06-03");

        let keys = vec![
            "code".to_string(),
            "trade_date".to_string(),
            "extra".to_string(),
        ];
        assert_eq!(
            record_hash_for_keys(&with_null, &keys),
            record_hash_for_keys(&without, &keys)
        );
    }
}
