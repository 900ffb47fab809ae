//! Full pipeline: stubbed endpoint → config-driven collector → task executor
//! → persistence.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use findata_backend::collector::CollectorConfig;
use findata_backend::core::mapping::FieldMappingRegistry;
use findata_backend::models::CollectParams;
use findata_backend::persistence::ConfigurablePersistence;
use findata_backend::task::registry::{
    ProgressHandle, TaskCategory, TaskExecutor, TaskMetadata, TaskRegistry, TaskStatus,
};
use findata_backend::task::CollectorTaskExecutor;

fn quote_task(server: &MockServer, persistence: Arc<ConfigurablePersistence>) -> CollectorTaskExecutor {
    let yaml = format!(
        r#"
collector_id: market_realtime
name: Market realtime snapshot
source: eastmoney
data_type: stock_quote
request:
  url: "{}/api/qt/clist/get"
parser:
  data_path: "data.diff"
field_mapping:
  f12: {{target: code, type: string}}
  f14: {{target: name, type: string}}
  f2: {{target: close, type: float}}
  f5: {{target: volume, type: integer}}
  f6: {{target: amount, type: float}}
required_fields: [code, trade_date]
dedup_keys: [code, trade_date]
rate_limit: 100.0
max_retries: 1
retry_delay: 0.01
"#,
        server.uri()
    );

    let metadata = TaskMetadata::new("stock_list", "Stock list snapshot", TaskCategory::Market);
    CollectorTaskExecutor::new(
        metadata,
        CollectorConfig::from_yaml(&yaml).unwrap(),
        "stock_daily_quote",
        persistence,
        Arc::new(FieldMappingRegistry::new()),
        None,
    )
}

#[tokio::test]
async fn collected_records_land_in_the_store() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/qt/clist/get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "diff": [
                    {"f12": "600000", "f14": "Bank A", "f2": 9.87, "f5": 1_000_000, "f6": 9_870_000.0},
                    {"f12": "000001", "f14": "Bank B", "f2": 11.2, "f5": 2_000_000, "f6": 22_400_000.0}
                ]
            }
        })))
        .mount(&server)
        .await;

    let persistence = Arc::new(ConfigurablePersistence::in_memory().unwrap());
    let task = quote_task(&server, persistence.clone());

    let progress = ProgressHandle::new("it-run");
    let summary = task.execute(&CollectParams::new(), &progress).await;

    assert!(summary.success);
    assert_eq!(summary.records_collected, 2);
    assert_eq!(summary.records_validated, 2);
    assert_eq!(summary.records_saved, 2);

    let snapshot = progress.snapshot();
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.saved_records, 2);
    assert!(snapshot.saved_records <= snapshot.processed_records);

    let rows = persistence
        .query_rows("SELECT code, name, close FROM main.stock_daily_quote ORDER BY code")
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("code").unwrap(), "000001");
    assert_eq!(rows[1].get("code").unwrap(), "600000");
    assert_eq!(rows[1].get("close").unwrap().as_f64(), Some(9.87));
}

#[tokio::test]
async fn repeated_runs_upsert_instead_of_duplicating() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/qt/clist/get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"diff": [{"f12": "600000", "f14": "Bank A", "f2": 9.87}]}
        })))
        .mount(&server)
        .await;

    let persistence = Arc::new(ConfigurablePersistence::in_memory().unwrap());
    let task = quote_task(&server, persistence.clone());

    for run in 0..2 {
        let progress = ProgressHandle::new(format!("run-{run}"));
        let summary = task.execute(&CollectParams::new(), &progress).await;
        assert!(summary.success);
    }

    let rows = persistence
        .query_rows("SELECT COUNT(*) AS n FROM main.stock_daily_quote")
        .unwrap();
    assert_eq!(rows[0].get("n").unwrap().as_i64(), Some(1));
}

#[tokio::test]
async fn upstream_failure_surfaces_through_the_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let persistence = Arc::new(ConfigurablePersistence::in_memory().unwrap());
    let task = quote_task(&server, persistence);

    let progress = ProgressHandle::new("failing-run");
    let summary = task.execute(&CollectParams::new(), &progress).await;

    assert!(!summary.success);
    assert_eq!(progress.snapshot().status, TaskStatus::Failed);
    assert!(progress.snapshot().error_message.is_some());
}

#[tokio::test]
async fn registry_round_trip_executes_by_task_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"diff": []}
        })))
        .mount(&server)
        .await;

    let persistence = Arc::new(ConfigurablePersistence::in_memory().unwrap());
    let registry = TaskRegistry::new();
    registry.register(Arc::new(quote_task(&server, persistence)));

    let executor = registry.executor("stock_list").unwrap();
    let progress = ProgressHandle::new("registry-run");
    let summary = executor.execute(&CollectParams::new(), &progress).await;

    assert!(summary.success);
    assert_eq!(summary.records_collected, 0);
}
