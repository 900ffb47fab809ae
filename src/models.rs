//! Canonical data models.
//!
//! Every record that leaves the field-mapping stage is shaped into one of the
//! canonical families below before it reaches persistence. Inside the mapping
//! transformer records stay as string-keyed JSON bags (`Record`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::core::errors::DatacenterError;

/// Untyped record bag used between response parsing and persistence.
/// Field names remain source-keyed until mapping completes.
pub type Record = Map<String, Value>;

/// Conversion into the string-keyed record shape accepted by persistence.
pub trait ToRecord {
    fn to_record(&self) -> Result<Record, DatacenterError>;
}

impl<T: Serialize> ToRecord for T {
    fn to_record(&self) -> Result<Record, DatacenterError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(DatacenterError::transformation(format!(
                "record must serialize to an object, got {}",
                value_kind(&other)
            ))),
            Err(e) => Err(DatacenterError::transformation(format!(
                "record serialization failed: {e}"
            ))),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parameter bag passed to collectors and task executors.
///
/// Mirrors the free-form keyword arguments of collector configs: URL
/// placeholders, query params and the reserved `symbols` / `start_date` /
/// `end_date` keys are all drawn from here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectParams(Map<String, Value>);

impl CollectParams {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// String rendering used for URL placeholder substitution and query
    /// params. Arrays are not rendered here; see [`CollectParams::symbols`].
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// The reserved `symbols` key: either a list of codes or a single
    /// comma-joined string.
    pub fn symbols(&self) -> Option<Vec<String>> {
        match self.0.get("symbols")? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            Value::String(s) => Some(s.split(',').map(|p| p.trim().to_string()).collect()),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for CollectParams {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for CollectParams {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Supported third-party data origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Eastmoney,
    Jinshi,
    Cls,
    Sina,
    Tushare,
    Akshare,
    Wind,
    Xueqiu,
    SseOption,
    SzseOption,
    Shfe,
    Dce,
    Czce,
    Cffex,
    Cninfo,
    Ths,
    Exchange,
    Research,
    Custom,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Eastmoney => "eastmoney",
            DataSource::Jinshi => "jinshi",
            DataSource::Cls => "cls",
            DataSource::Sina => "sina",
            DataSource::Tushare => "tushare",
            DataSource::Akshare => "akshare",
            DataSource::Wind => "wind",
            DataSource::Xueqiu => "xueqiu",
            DataSource::SseOption => "sse_option",
            DataSource::SzseOption => "szse_option",
            DataSource::Shfe => "shfe",
            DataSource::Dce => "dce",
            DataSource::Czce => "czce",
            DataSource::Cffex => "cffex",
            DataSource::Cninfo => "cninfo",
            DataSource::Ths => "ths",
            DataSource::Exchange => "exchange",
            DataSource::Research => "research",
            DataSource::Custom => "custom",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = DatacenterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| DatacenterError::configuration(format!("unknown data source: {s}")))
    }
}

/// Classification of what a collected record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    StockQuote,
    StockQuoteRealtime,
    StockQuoteIntraday,
    StockKline,
    StockFundamental,
    StockFinancialReport,
    StockFinancialIndicator,
    StockNews,
    StockMoneyFlow,
    StockHolder,
    StockMarginTrade,
    IndustryData,
    IndustryMember,
    ConceptData,
    ConceptMember,
    MacroData,
    MacroGdp,
    MacroCpi,
    MacroPpi,
    MacroPmi,
    MacroMoneySupply,
    MacroInterestRate,
    MarketNews,
    OptionQuote,
    FutureQuote,
    EtfQuote,
    FundNetValue,
    IndexQuote,
    NorthMoney,
    DragonTiger,
    EsgRating,
    SocialMedia,
    FactorData,
    KgEntity,
    KgRelation,
    KgEvent,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        // serde produces the same snake_case names; this avoids allocating
        // through serde_json for hot-path registry keys.
        match self {
            DataType::StockQuote => "stock_quote",
            DataType::StockQuoteRealtime => "stock_quote_realtime",
            DataType::StockQuoteIntraday => "stock_quote_intraday",
            DataType::StockKline => "stock_kline",
            DataType::StockFundamental => "stock_fundamental",
            DataType::StockFinancialReport => "stock_financial_report",
            DataType::StockFinancialIndicator => "stock_financial_indicator",
            DataType::StockNews => "stock_news",
            DataType::StockMoneyFlow => "stock_money_flow",
            DataType::StockHolder => "stock_holder",
            DataType::StockMarginTrade => "stock_margin_trade",
            DataType::IndustryData => "industry_data",
            DataType::IndustryMember => "industry_member",
            DataType::ConceptData => "concept_data",
            DataType::ConceptMember => "concept_member",
            DataType::MacroData => "macro_data",
            DataType::MacroGdp => "macro_gdp",
            DataType::MacroCpi => "macro_cpi",
            DataType::MacroPpi => "macro_ppi",
            DataType::MacroPmi => "macro_pmi",
            DataType::MacroMoneySupply => "macro_money_supply",
            DataType::MacroInterestRate => "macro_interest_rate",
            DataType::MarketNews => "market_news",
            DataType::OptionQuote => "option_quote",
            DataType::FutureQuote => "future_quote",
            DataType::EtfQuote => "etf_quote",
            DataType::FundNetValue => "fund_net_value",
            DataType::IndexQuote => "index_quote",
            DataType::NorthMoney => "north_money",
            DataType::DragonTiger => "dragon_tiger",
            DataType::EsgRating => "esg_rating",
            DataType::SocialMedia => "social_media",
            DataType::FactorData => "factor_data",
            DataType::KgEntity => "kg_entity",
            DataType::KgRelation => "kg_relation",
            DataType::KgEvent => "kg_event",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data categories for task organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Market,
    Fundamental,
    Derivative,
    Alternative,
    Macro,
    KnowledgeGraph,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::Market => "market",
            DataCategory::Fundamental => "fundamental",
            DataCategory::Derivative => "derivative",
            DataCategory::Alternative => "alternative",
            DataCategory::Macro => "macro",
            DataCategory::KnowledgeGraph => "knowledge_graph",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collection cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFrequency {
    #[serde(rename = "tick")]
    Tick,
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "60m")]
    Minute60,
    #[serde(rename = "d", alias = "daily")]
    Daily,
    #[serde(rename = "w", alias = "weekly")]
    Weekly,
    #[serde(rename = "m", alias = "monthly")]
    Monthly,
    #[serde(rename = "q", alias = "quarterly")]
    Quarterly,
    #[serde(rename = "y", alias = "yearly")]
    Yearly,
}

impl DataFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFrequency::Tick => "tick",
            DataFrequency::Minute1 => "1m",
            DataFrequency::Minute5 => "5m",
            DataFrequency::Minute15 => "15m",
            DataFrequency::Minute30 => "30m",
            DataFrequency::Minute60 => "60m",
            DataFrequency::Daily => "d",
            DataFrequency::Weekly => "w",
            DataFrequency::Monthly => "m",
            DataFrequency::Quarterly => "q",
            DataFrequency::Yearly => "y",
        }
    }
}

impl Default for DataFrequency {
    fn default() -> Self {
        DataFrequency::Daily
    }
}

/// Daily / intraday stock quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockQuoteData {
    pub code: String,
    pub name: String,
    pub trade_date: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub pre_close: Option<f64>,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
    pub volume: Option<i64>,
    pub amount: Option<f64>,
    pub turnover_rate: Option<f64>,
    pub amplitude: Option<f64>,
    pub market_cap: Option<f64>,
    pub circulating_market_cap: Option<f64>,
    pub collected_at: DateTime<Utc>,
}

/// Money flow decomposition for one symbol on one day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoneyFlowData {
    pub code: String,
    pub name: Option<String>,
    pub trade_date: String,
    pub main_net_inflow: Option<f64>,
    pub main_net_inflow_pct: Option<f64>,
    pub super_large_net_inflow: Option<f64>,
    pub large_net_inflow: Option<f64>,
    pub medium_net_inflow: Option<f64>,
    pub small_net_inflow: Option<f64>,
    pub north_net_inflow: Option<f64>,
    pub collected_at: DateTime<Utc>,
}

/// Per-report financial indicators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialIndicatorData {
    pub code: String,
    pub name: Option<String>,
    pub report_date: String,
    pub eps: Option<f64>,
    pub bps: Option<f64>,
    pub roe: Option<f64>,
    pub roa: Option<f64>,
    pub gross_margin: Option<f64>,
    pub net_margin: Option<f64>,
    pub debt_ratio: Option<f64>,
    pub current_ratio: Option<f64>,
    pub quick_ratio: Option<f64>,
    pub revenue: Option<f64>,
    pub net_profit: Option<f64>,
    pub revenue_yoy: Option<f64>,
    pub net_profit_yoy: Option<f64>,
    pub collected_at: DateTime<Utc>,
}

/// News item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsData {
    pub news_id: String,
    pub title: String,
    pub content: String,
    pub source: String,
    pub category: Option<String>,
    pub keywords: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
}

/// Macro economic indicator observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroData {
    pub indicator_code: String,
    pub indicator_name: String,
    pub value: f64,
    pub unit: String,
    pub period: String,
    pub country: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
}

/// Option quote with greeks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionData {
    pub code: String,
    pub name: String,
    pub underlying: String,
    pub strike_price: f64,
    pub expiry_date: String,
    pub option_type: String,
    pub last_price: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub volume: Option<i64>,
    pub open_interest: Option<i64>,
    pub implied_volatility: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub trade_date: String,
    pub collected_at: DateTime<Utc>,
}

/// Future quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FutureData {
    pub code: String,
    pub name: String,
    pub exchange: String,
    pub delivery_month: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub pre_settlement: Option<f64>,
    pub settlement: Option<f64>,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
    pub volume: Option<i64>,
    pub amount: Option<f64>,
    pub open_interest: Option<i64>,
    pub trade_date: String,
    pub collected_at: DateTime<Utc>,
}

/// A factor observation for one symbol on one date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorData {
    pub factor_id: String,
    pub factor_name: String,
    pub factor_category: String,
    pub code: String,
    pub trade_date: String,
    pub factor_value: f64,
    pub factor_rank: Option<i64>,
    pub factor_percentile: Option<f64>,
    pub neutralized: bool,
    pub collected_at: DateTime<Utc>,
}

/// Knowledge-graph entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgEntityData {
    pub entity_id: String,
    pub entity_type: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub code: Option<String>,
    pub industry: Option<String>,
    pub properties: HashMap<String, Value>,
    pub source: String,
    pub confidence: f64,
    pub collected_at: DateTime<Utc>,
}

/// Knowledge-graph relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgRelationData {
    pub relation_id: String,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relation_type: String,
    pub weight: f64,
    pub confidence: f64,
    pub evidence: Option<String>,
    pub properties: HashMap<String, Value>,
    pub source: String,
    pub collected_at: DateTime<Utc>,
}

/// Knowledge-graph event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgEventData {
    pub event_id: String,
    pub event_type: String,
    pub title: String,
    pub content: Option<String>,
    pub related_entities: Vec<String>,
    pub event_date: String,
    pub impact_level: Option<String>,
    pub sentiment: Option<f64>,
    pub source: String,
    pub confidence: f64,
    pub collected_at: DateTime<Utc>,
}

/// ESG rating composite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsgData {
    pub code: String,
    pub name: String,
    pub rating_agency: String,
    pub esg_score: Option<f64>,
    pub e_score: Option<f64>,
    pub s_score: Option<f64>,
    pub g_score: Option<f64>,
    pub esg_rating: Option<String>,
    pub rating_date: String,
    pub collected_at: DateTime<Utc>,
}

/// Social media post with sentiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialMediaData {
    pub platform: String,
    pub code: Option<String>,
    pub post_id: String,
    pub content: String,
    pub author: Option<String>,
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub reposts: Option<i64>,
    pub sentiment: Option<f64>,
    pub keywords: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_to_record_yields_object() {
        let quote = StockQuoteData {
            code: "600000".to_string(),
            name: "Bank A".to_string(),
            trade_date: "2024-06-03".to_string(),
            open: Some(9.8),
            high: None,
            low: None,
            close: Some(9.87),
            pre_close: None,
            change: None,
            change_pct: Some(1.2),
            volume: Some(1_000_000),
            amount: Some(9_870_000.0),
            turnover_rate: None,
            amplitude: None,
            market_cap: None,
            circulating_market_cap: None,
            collected_at: Utc::now(),
        };

        let record = quote.to_record().unwrap();
        assert_eq!(record.get("code").unwrap(), "600000");
        assert_eq!(record.get("close").unwrap().as_f64(), Some(9.87));
        assert!(record.get("high").unwrap().is_null());
    }

    #[test]
    fn to_record_rejects_non_object() {
        let err = "just a string".to_record().unwrap_err();
        assert!(err.to_string().contains("object"));
    }

    #[test]
    fn data_source_round_trips_through_str() {
        for source in [DataSource::Eastmoney, DataSource::SseOption, DataSource::Custom] {
            assert_eq!(source.as_str().parse::<DataSource>().unwrap(), source);
        }
        assert!("not_a_source".parse::<DataSource>().is_err());
    }

    #[test]
    fn collect_params_symbols_accepts_list_and_csv() {
        let p = CollectParams::new().with("symbols", serde_json::json!(["600000", "000001"]));
        assert_eq!(p.symbols().unwrap(), vec!["600000", "000001"]);

        let p = CollectParams::new().with("symbols", "600000, 000001");
        assert_eq!(p.symbols().unwrap(), vec!["600000", "000001"]);
    }
}
