//! Built-in task executors.
//!
//! Every built-in task is a [`CollectorTaskExecutor`]: a declarative
//! collector config paired with a target table. Collect goes through the
//! config-driven collector, validation re-checks the config's required
//! fields, save goes through the persistence engine.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::collector::{CollectionStatus, CollectorConfig, ConfigDrivenCollector};
use crate::core::config::{DatacenterConfig, SourceSettings};
use crate::core::errors::DatacenterError;
use crate::core::mapping::FieldMappingRegistry;
use crate::models::{CollectParams, Record};
use crate::persistence::ConfigurablePersistence;
use crate::task::registry::{
    ProgressHandle, TaskCategory, TaskExecutor, TaskMetadata, TaskOutput, TaskParameter,
    TaskPriority, TaskRegistry,
};

/// Adapts a collector config + target table into a registered task.
pub struct CollectorTaskExecutor {
    metadata: TaskMetadata,
    collector_config: CollectorConfig,
    table_name: String,
    persistence: Arc<ConfigurablePersistence>,
    mapping_registry: Arc<FieldMappingRegistry>,
    source_settings: Option<SourceSettings>,
}

impl CollectorTaskExecutor {
    pub fn new(
        metadata: TaskMetadata,
        collector_config: CollectorConfig,
        table_name: impl Into<String>,
        persistence: Arc<ConfigurablePersistence>,
        mapping_registry: Arc<FieldMappingRegistry>,
        source_settings: Option<SourceSettings>,
    ) -> Self {
        Self {
            metadata,
            collector_config,
            table_name: table_name.into(),
            persistence,
            mapping_registry,
            source_settings,
        }
    }

}

#[async_trait]
impl TaskExecutor for CollectorTaskExecutor {
    fn metadata(&self) -> &TaskMetadata {
        &self.metadata
    }

    async fn collect(
        &self,
        params: &CollectParams,
        progress: &ProgressHandle,
    ) -> Result<Vec<Record>, DatacenterError> {
        let params = self.metadata.validate_params(params)?;
        progress.set_detail("source", json!(self.collector_config.source.as_str()));

        // A fresh collector per run; it owns its HTTP client for the run's
        // lifetime.
        let collector = ConfigDrivenCollector::from_config(
            self.collector_config.clone(),
            self.source_settings.clone(),
            self.mapping_registry.clone(),
        )?;

        collector.start().await?;
        let result = collector.collect(&params).await;
        collector.stop().await?;

        if result.status != CollectionStatus::Completed {
            return Err(DatacenterError::external(
                result
                    .error_message
                    .unwrap_or_else(|| "collection failed".to_string()),
                self.collector_config.source.as_str(),
            ));
        }

        progress.set_detail(
            "records_deduplicated",
            json!(result.records_deduplicated),
        );

        Ok(result.data)
    }

    async fn validate(&self, records: Vec<Record>) -> Result<Vec<Record>, DatacenterError> {
        let required = &self.collector_config.required_fields;
        Ok(records
            .into_iter()
            .filter(|record| {
                required
                    .iter()
                    .all(|field| record.get(field).map(|v| !v.is_null()).unwrap_or(false))
            })
            .collect())
    }

    async fn save(
        &self,
        records: Vec<Record>,
        progress: &ProgressHandle,
    ) -> Result<usize, DatacenterError> {
        let saved = self.persistence.save(&self.table_name, &records).await?;
        progress.set_saved(saved);
        Ok(saved)
    }
}

/// Shared context for building the built-in task set.
pub struct TaskContext {
    pub persistence: Arc<ConfigurablePersistence>,
    pub mapping_registry: Arc<FieldMappingRegistry>,
    pub datacenter: DatacenterConfig,
}

impl TaskContext {
    fn settings(&self, source: &str) -> Option<SourceSettings> {
        self.datacenter.source(source).cloned()
    }

    fn task(
        &self,
        metadata: TaskMetadata,
        collector_yaml: &str,
        table_name: &str,
    ) -> Result<Arc<CollectorTaskExecutor>, DatacenterError> {
        let collector_config = CollectorConfig::from_yaml(collector_yaml)?;
        let settings = self.settings(collector_config.source.as_str());
        Ok(Arc::new(CollectorTaskExecutor::new(
            metadata,
            collector_config,
            table_name,
            self.persistence.clone(),
            self.mapping_registry.clone(),
            settings,
        )))
    }
}

/// Register the standard task set.
pub fn register_builtin_tasks(
    registry: &TaskRegistry,
    context: &TaskContext,
) -> Result<(), DatacenterError> {
    registry.register(stock_list_task(context)?);
    registry.register(realtime_quote_task(context)?);
    registry.register(kline_daily_task(context)?);
    registry.register(money_flow_task(context)?);
    registry.register(north_money_task(context)?);
    registry.register(news_feed_task(context)?);
    registry.register(money_supply_task(context)?);
    registry.register(financial_indicator_task(context)?);
    Ok(())
}

fn stock_list_task(
    context: &TaskContext,
) -> Result<Arc<CollectorTaskExecutor>, DatacenterError> {
    let mut metadata = TaskMetadata::new(
        "stock_list",
        "Stock list snapshot",
        TaskCategory::Market,
    );
    metadata.description = "Full A-share market realtime snapshot".to_string();
    metadata.source = "eastmoney".to_string();
    metadata.priority = TaskPriority::High;
    metadata.timeout = std::time::Duration::from_secs(60);
    metadata.parameters = vec![TaskParameter::new("market", "string")
        .default_value(json!("沪深A"))
        .describe("Market segment")
        .choices(&["沪深A", "上证A", "深证A", "创业板", "科创板", "北证A"])];
    metadata.output = Some(TaskOutput {
        data_type: "stock_quote".to_string(),
        table_name: "stock_daily_quote".to_string(),
        description: "Daily stock quotes".to_string(),
        fields: vec![
            "code".to_string(),
            "name".to_string(),
            "trade_date".to_string(),
            "close".to_string(),
            "volume".to_string(),
            "amount".to_string(),
        ],
    });
    metadata.tags = vec!["market".to_string(), "realtime".to_string()];

    context.task(
        metadata,
        r#"
collector_id: market_realtime
name: Market realtime snapshot
source: eastmoney
data_type: stock_quote
frequency: d
request:
  method: GET
  url: "https://push2.eastmoney.com/api/qt/clist/get"
  params:
    po: 1
    pz: 5000
    pn: 1
    np: 1
    fltt: 2
    invt: 2
    fields: "f2,f3,f4,f5,f6,f7,f8,f12,f14,f15,f16,f17,f18,f20,f21"
  timeout: 30.0
parser:
  data_path: "data.diff"
  total_path: "data.total"
field_mapping:
  f12:
    target: code
    type: string
    required: true
  f14:
    target: name
    type: string
  f17: {target: open, type: float}
  f15: {target: high, type: float}
  f16: {target: low, type: float}
  f2: {target: close, type: float}
  f18: {target: pre_close, type: float}
  f4: {target: change, type: float}
  f3: {target: change_pct, type: float}
  f5: {target: volume, type: integer}
  f6: {target: amount, type: float}
  f8: {target: turnover_rate, type: float}
  f20: {target: market_cap, type: float}
required_fields: [code, trade_date]
dedup_keys: [code, trade_date]
rate_limit: 5.0
"#,
        "stock_daily_quote",
    )
}

fn realtime_quote_task(
    context: &TaskContext,
) -> Result<Arc<CollectorTaskExecutor>, DatacenterError> {
    let mut metadata = TaskMetadata::new(
        "realtime_quote",
        "Realtime quotes by code",
        TaskCategory::Market,
    );
    metadata.description = "Realtime quotes for a code list".to_string();
    metadata.source = "eastmoney".to_string();
    metadata.priority = TaskPriority::Critical;
    metadata.timeout = std::time::Duration::from_secs(30);
    metadata.parameters = vec![TaskParameter::new("secids", "string")
        .default_value(json!("1.600000,0.000001"))
        .describe("Comma-joined quote-server secids")];
    metadata.output = Some(TaskOutput {
        data_type: "stock_quote".to_string(),
        table_name: "stock_daily_quote".to_string(),
        description: "Realtime quotes".to_string(),
        fields: Vec::new(),
    });
    metadata.tags = vec!["market".to_string(), "realtime".to_string()];

    context.task(
        metadata,
        r#"
collector_id: realtime_quote
name: Realtime quotes
source: eastmoney
data_type: stock_quote_realtime
frequency: tick
request:
  method: GET
  url: "https://push2.eastmoney.com/api/qt/ulist.np/get"
  params:
    fltt: 2
    invt: 2
    fields: "f2,f3,f4,f5,f6,f12,f14"
  timeout: 15.0
parser:
  data_path: "data.diff"
field_mapping:
  f12:
    target: code
    type: string
    required: true
  f14: {target: name, type: string}
  f2: {target: close, type: float}
  f3: {target: change_pct, type: float}
  f4: {target: change, type: float}
  f5: {target: volume, type: integer}
  f6: {target: amount, type: float}
required_fields: [code, close]
dedup_keys: [code, trade_date]
rate_limit: 10.0
"#,
        "stock_daily_quote",
    )
}

fn kline_daily_task(
    context: &TaskContext,
) -> Result<Arc<CollectorTaskExecutor>, DatacenterError> {
    let mut metadata = TaskMetadata::new(
        "kline_daily",
        "Daily K-line history",
        TaskCategory::Market,
    );
    metadata.description = "Daily bars for one symbol".to_string();
    metadata.source = "eastmoney".to_string();
    metadata.priority = TaskPriority::High;
    metadata.parameters = vec![
        TaskParameter::new("secid", "string")
            .required()
            .describe("Quote-server secid, e.g. 1.600000"),
        TaskParameter::new("beg", "string").default_value(json!("20240101")),
        TaskParameter::new("end", "string").default_value(json!("20501231")),
    ];
    metadata.output = Some(TaskOutput {
        data_type: "stock_kline".to_string(),
        table_name: "stock_daily_quote".to_string(),
        description: "Daily OHLCV bars".to_string(),
        fields: Vec::new(),
    });
    metadata.tags = vec!["market".to_string(), "history".to_string()];

    context.task(
        metadata,
        r#"
collector_id: kline_daily
name: Daily K-line
source: eastmoney
data_type: stock_kline
frequency: d
request:
  method: GET
  url: "https://push2his.eastmoney.com/api/qt/stock/kline/get"
  params:
    klt: 101
    fqt: 1
    fields1: "f1,f2,f3,f4,f5,f6"
    fields2: "f51,f52,f53,f54,f55,f56,f57"
  timeout: 30.0
parser:
  data_path: "data.klines"
field_mapping:
  code:
    target: code
    type: string
  date: {target: trade_date, type: date}
  open: {target: open, type: float}
  close: {target: close, type: float}
  high: {target: high, type: float}
  low: {target: low, type: float}
  volume: {target: volume, type: integer}
  amount: {target: amount, type: float}
required_fields: [code, trade_date]
dedup_keys: [code, trade_date]
rate_limit: 5.0
"#,
        "stock_daily_quote",
    )
}

fn money_flow_task(
    context: &TaskContext,
) -> Result<Arc<CollectorTaskExecutor>, DatacenterError> {
    let mut metadata = TaskMetadata::new(
        "daily_money_flow",
        "Daily money flow ranking",
        TaskCategory::Market,
    );
    metadata.description = "Per-stock money flow decomposition".to_string();
    metadata.source = "eastmoney".to_string();
    metadata.output = Some(TaskOutput {
        data_type: "stock_money_flow".to_string(),
        table_name: "stock_money_flow".to_string(),
        description: "Money flow by size bucket".to_string(),
        fields: Vec::new(),
    });
    metadata.tags = vec!["market".to_string(), "money_flow".to_string()];

    context.task(
        metadata,
        r#"
collector_id: daily_money_flow
name: Daily money flow
source: eastmoney
data_type: stock_money_flow
frequency: d
request:
  method: GET
  url: "https://push2.eastmoney.com/api/qt/clist/get"
  params:
    po: 1
    pz: 5000
    pn: 1
    np: 1
    fltt: 2
    fields: "f12,f14,f62,f66,f72,f78,f84,f184"
  timeout: 30.0
parser:
  data_path: "data.diff"
field_mapping:
  f12:
    target: code
    type: string
    required: true
  f14: {target: name, type: string}
  f62: {target: main_net_inflow, type: float}
  f184: {target: main_net_inflow_pct, type: float}
  f66: {target: super_large_net_inflow, type: float}
  f72: {target: large_net_inflow, type: float}
  f78: {target: medium_net_inflow, type: float}
  f84: {target: small_net_inflow, type: float}
required_fields: [code, trade_date]
dedup_keys: [code, trade_date]
rate_limit: 5.0
"#,
        "stock_money_flow",
    )
}

fn north_money_task(
    context: &TaskContext,
) -> Result<Arc<CollectorTaskExecutor>, DatacenterError> {
    let mut metadata = TaskMetadata::new(
        "north_money",
        "Northbound money flow",
        TaskCategory::Market,
    );
    metadata.description = "Northbound connect flow totals".to_string();
    metadata.source = "eastmoney".to_string();
    metadata.priority = TaskPriority::Low;
    metadata.output = Some(TaskOutput {
        data_type: "north_money".to_string(),
        table_name: "north_money".to_string(),
        description: "Daily northbound totals".to_string(),
        fields: Vec::new(),
    });
    metadata.tags = vec!["market".to_string(), "north_money".to_string()];

    context.task(
        metadata,
        r#"
collector_id: north_money
name: Northbound money flow
source: eastmoney
data_type: north_money
frequency: d
request:
  method: GET
  url: "https://datacenter-web.eastmoney.com/api/data/v1/get"
  params:
    reportName: "RPT_MUTUAL_DEAL_HISTORY"
    columns: "ALL"
    source: "WEB"
    client: "WEB"
    pageSize: 500
parser:
  data_path: "result.data"
  error_check: "success==true"
field_mapping:
  TRADE_DATE:
    target: trade_date
    type: date
    required: true
  FUND_INFLOW: {target: total_net_inflow, type: float}
  SH_INFLOW: {target: sh_net_inflow, type: float}
  SZ_INFLOW: {target: sz_net_inflow, type: float}
required_fields: [trade_date]
dedup_keys: [trade_date]
rate_limit: 2.0
"#,
        "north_money",
    )
}

fn news_feed_task(
    context: &TaskContext,
) -> Result<Arc<CollectorTaskExecutor>, DatacenterError> {
    let mut metadata = TaskMetadata::new("news_feed", "Market news feed", TaskCategory::News);
    metadata.description = "Realtime financial telegraph feed".to_string();
    metadata.source = "cls".to_string();
    metadata.priority = TaskPriority::Normal;
    metadata.parameters = vec![TaskParameter::new("rn", "integer")
        .default_value(json!(50))
        .describe("Number of items to pull")];
    metadata.output = Some(TaskOutput {
        data_type: "market_news".to_string(),
        table_name: "news".to_string(),
        description: "News items".to_string(),
        fields: Vec::new(),
    });
    metadata.tags = vec!["news".to_string()];

    context.task(
        metadata,
        r#"
collector_id: news_feed
name: Telegraph news feed
source: cls
data_type: market_news
frequency: tick
request:
  method: GET
  url: "https://www.cls.cn/nodeapi/telegraphList"
  params:
    app: CailianpressWeb
    os: web
parser:
  data_path: "data.roll_data"
field_mapping:
  id:
    target: news_id
    type: string
    required: true
  title: {target: title, type: string}
  content: {target: content, type: string}
  ctime: {target: published_at, type: datetime}
required_fields: [news_id, title]
dedup_keys: [news_id]
dedup_enabled: true
rate_limit: 1.0
"#,
        "news",
    )
}

fn money_supply_task(
    context: &TaskContext,
) -> Result<Arc<CollectorTaskExecutor>, DatacenterError> {
    let mut metadata = TaskMetadata::new(
        "macro_money_supply",
        "Money supply series",
        TaskCategory::Macro,
    );
    metadata.description = "M2/M1/M0 monthly series".to_string();
    metadata.source = "eastmoney".to_string();
    metadata.priority = TaskPriority::Background;
    metadata.output = Some(TaskOutput {
        data_type: "macro_money_supply".to_string(),
        table_name: "macro_economic".to_string(),
        description: "Macro indicator values".to_string(),
        fields: Vec::new(),
    });
    metadata.tags = vec!["macro".to_string()];

    context.task(
        metadata,
        r#"
collector_id: macro_money_supply
name: Money supply
source: eastmoney
data_type: macro_money_supply
frequency: m
request:
  method: GET
  url: "https://datacenter-web.eastmoney.com/api/data/v1/get"
  params:
    reportName: "RPT_ECONOMY_CURRENCY_SUPPLY"
    columns: "TIME,BASIC_CURRENCY,CURRENCY,FREE_CASH"
    pageSize: 100
    sortColumns: "REPORT_DATE"
    sortTypes: "-1"
    source: "WEB"
    client: "WEB"
parser:
  data_path: "result.data"
field_mapping:
  TIME:
    target: report_date
    type: string
    required: true
  CURRENCY: {target: value, type: float}
  indicator_id:
    target: indicator_id
    type: string
    default: "MONEY_SUPPLY"
  indicator_name:
    target: indicator_name
    type: string
    default: "money supply"
  unit:
    target: unit
    type: string
    default: "100M CNY"
required_fields: [report_date]
dedup_keys: [indicator_id, report_date]
rate_limit: 2.0
"#,
        "macro_economic",
    )
}

fn financial_indicator_task(
    context: &TaskContext,
) -> Result<Arc<CollectorTaskExecutor>, DatacenterError> {
    let mut metadata = TaskMetadata::new(
        "financial_indicator",
        "Financial indicators",
        TaskCategory::Fundamental,
    );
    metadata.description = "Per-report financial indicators".to_string();
    metadata.source = "eastmoney".to_string();
    metadata.parameters = vec![TaskParameter::new("code", "string")
        .required()
        .describe("Six-digit stock code")];
    metadata.output = Some(TaskOutput {
        data_type: "stock_financial_indicator".to_string(),
        table_name: "stock_financial_indicator".to_string(),
        description: "Key financial ratios per report date".to_string(),
        fields: Vec::new(),
    });
    metadata.tags = vec!["fundamental".to_string()];

    context.task(
        metadata,
        r#"
collector_id: financial_indicator
name: Financial indicators
source: eastmoney
data_type: stock_financial_indicator
frequency: q
request:
  method: GET
  url: "https://datacenter-web.eastmoney.com/api/data/v1/get"
  params:
    reportName: "RPT_LICO_FN_CPD"
    columns: "ALL"
    source: "WEB"
    client: "WEB"
    filter: '(SECURITY_CODE="{code}")'
parser:
  data_path: "result.data"
field_mapping:
  SECURITY_CODE:
    target: code
    type: string
    required: true
  SECURITY_NAME_ABBR: {target: name, type: string}
  REPORT_DATE:
    target: report_date
    type: date
    required: true
  BASIC_EPS: {target: eps, type: float}
  BPS: {target: bps, type: float}
  WEIGHTAVG_ROE: {target: roe, type: float}
  XSMLL: {target: gross_margin, type: float}
  TOTAL_OPERATE_INCOME: {target: revenue, type: float}
  PARENT_NETPROFIT: {target: net_profit, type: float}
required_fields: [code, report_date]
dedup_keys: [code, report_date]
rate_limit: 2.0
"#,
        "stock_financial_indicator",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::registry::TaskRegistry;

    fn context() -> TaskContext {
        TaskContext {
            persistence: Arc::new(ConfigurablePersistence::in_memory().unwrap()),
            mapping_registry: Arc::new(FieldMappingRegistry::new()),
            datacenter: DatacenterConfig::default(),
        }
    }

    #[test]
    fn builtin_tasks_register_cleanly() {
        let registry = TaskRegistry::new();
        register_builtin_tasks(&registry, &context()).unwrap();

        let tasks = registry.list_tasks(None);
        assert!(tasks.len() >= 8);
        // Critical tasks sort first.
        assert_eq!(tasks[0].task_type, "realtime_quote");

        let categories = registry.list_categories();
        assert!(categories[&TaskCategory::Market] >= 4);
        assert!(categories.contains_key(&TaskCategory::Macro));
        assert!(categories.contains_key(&TaskCategory::News));
    }

    #[test]
    fn builtin_tasks_target_registered_tables() {
        let context = context();
        let registry = TaskRegistry::new();
        register_builtin_tasks(&registry, &context).unwrap();

        for metadata in registry.list_tasks(None) {
            let output = metadata.output.expect("builtin tasks declare output");
            assert!(
                context.persistence.table_config(&output.table_name).is_some(),
                "missing table config for {}",
                output.table_name
            );
        }
    }

    #[test]
    fn builtin_task_info_is_complete() {
        let registry = TaskRegistry::new();
        register_builtin_tasks(&registry, &context()).unwrap();

        let info = registry.task_info("stock_list").unwrap();
        assert_eq!(info["category"], "market");
        assert_eq!(info["output"]["table_name"], "stock_daily_quote");
        assert_eq!(info["parameters"][0]["name"], "market");
    }
}
