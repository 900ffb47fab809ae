//! Configuration-driven collector.
//!
//! A collector defined entirely by declarative config: request shape, auth,
//! response parsing, field mapping, dedup and validation all come from a
//! [`CollectorConfig`] loaded from YAML/JSON or built programmatically.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::collector::base::{
    record_hash_for_keys, CollectionConfig, Collector, RecordFetcher,
};
use crate::core::config::{resolve_env_ref, SourceSettings};
use crate::core::errors::DatacenterError;
use crate::core::http::{HttpClient, HttpRequest, RateLimitPolicy, RetryPolicy};
use crate::core::mapping::{
    BuiltinConverter, FieldMapping, FieldMappingRegistry, FieldRule, FieldType,
};
use crate::models::{CollectParams, DataFrequency, DataSource, DataType, Record};

/// HTTP request types supported by config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    #[default]
    Get,
    Post,
}

/// Authentication types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    ApiKey,
    Bearer,
    Custom,
}

/// Declarative request shape. The URL may contain `{placeholder}` slots
/// substituted from collect params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub method: RequestType,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, Value>,
    pub body: Option<Value>,
    pub timeout: f64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            method: RequestType::Get,
            url: String::new(),
            headers: HashMap::new(),
            params: HashMap::new(),
            body: None,
            timeout: 30.0,
        }
    }
}

/// Declarative auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    pub api_key: Option<String>,
    pub header_name: String,
    pub prefix: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_type: AuthType::None,
            api_key: None,
            header_name: "Authorization".to_string(),
            prefix: None,
        }
    }
}

impl AuthConfig {
    /// Apply auth to a header map. Key resolution happens here, at request
    /// time, so rotated environment secrets are picked up live.
    pub fn apply(
        &self,
        headers: &mut HashMap<String, String>,
        settings: Option<&SourceSettings>,
    ) {
        if self.auth_type == AuthType::None {
            return;
        }
        let Some(key) = self.resolve_api_key(settings) else {
            return;
        };

        let value = match self.auth_type {
            AuthType::ApiKey => key,
            AuthType::Bearer => format!("Bearer {key}"),
            AuthType::Custom => match &self.prefix {
                Some(prefix) => format!("{prefix} {key}"),
                None => key,
            },
            AuthType::None => unreachable!(),
        };
        headers.insert(self.header_name.clone(), value);
    }

    /// Source settings win over the config's own key; both honor
    /// `${NAME}` / `$NAME` environment references.
    fn resolve_api_key(&self, settings: Option<&SourceSettings>) -> Option<String> {
        if let Some(key) = settings.and_then(|s| s.resolve_api_key()) {
            return Some(key);
        }
        self.api_key.as_deref().and_then(resolve_env_ref)
    }
}

/// Where the record array lives inside the response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub data_path: String,
    pub total_path: Option<String>,
    pub error_path: Option<String>,
    pub error_check: Option<String>,
}

const WELL_KNOWN_DATA_KEYS: [&str; 4] = ["data", "items", "results", "list"];

impl ParserConfig {
    /// Extract the record list from a response body.
    pub fn parse(&self, response: &Value) -> Vec<Record> {
        if self.data_path.is_empty() {
            if let Value::Array(items) = response {
                return collect_objects(items);
            }
            if let Value::Object(map) = response {
                for key in WELL_KNOWN_DATA_KEYS {
                    if let Some(Value::Array(items)) = map.get(key) {
                        return collect_objects(items);
                    }
                }
                return vec![map.clone()];
            }
            return Vec::new();
        }

        match navigate(response, &self.data_path) {
            Some(Value::Array(items)) => collect_objects(items),
            Some(Value::Object(map)) => vec![map.clone()],
            _ => Vec::new(),
        }
    }

    /// Pagination total, when declared.
    pub fn total(&self, response: &Value) -> Option<u64> {
        let path = self.total_path.as_deref()?;
        navigate(response, path)?.as_u64()
    }

    /// Detect a logical error in a 200-response.
    ///
    /// `error_path` names a field carrying an upstream error message;
    /// `error_check` is an `path==expected` / `path!=expected` guard that
    /// must hold for the response to count as success.
    pub fn check_error(&self, response: &Value) -> Option<String> {
        if let Some(path) = self.error_path.as_deref() {
            match navigate(response, path) {
                Some(Value::Null) | None => {}
                Some(Value::String(s)) if s.is_empty() => {}
                Some(value) => {
                    return Some(match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                }
            }
        }

        if let Some(check) = self.error_check.as_deref() {
            let (path, expected, negated) = if let Some((p, e)) = check.split_once("!=") {
                (p, e, true)
            } else if let Some((p, e)) = check.split_once("==") {
                (p, e, false)
            } else {
                return None;
            };

            let actual = navigate(response, path.trim())
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            let matches = actual == expected.trim();
            if matches == negated {
                return Some(format!(
                    "error check '{check}' failed (actual: {actual})"
                ));
            }
        }

        None
    }
}

fn collect_objects(items: &[Value]) -> Vec<Record> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map.clone()),
            _ => None,
        })
        .collect()
}

/// Walk a dotted path; numeric segments index into arrays.
fn navigate<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Complete declarative collector definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub collector_id: String,
    #[serde(default)]
    pub name: String,
    pub source: DataSource,
    pub data_type: DataType,
    #[serde(default)]
    pub frequency: DataFrequency,

    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub parser: ParserConfig,

    /// `"source_field": "target"` shorthand or
    /// `"source_field": {target, type, default, converter, required}`.
    #[serde(default)]
    pub field_mapping: Map<String, Value>,
    #[serde(default)]
    pub required_fields: Vec<String>,

    #[serde(default = "default_dedup_keys")]
    pub dedup_keys: Vec<String>,
    #[serde(default = "default_true")]
    pub dedup_enabled: bool,

    #[serde(default = "default_rate_limit")]
    pub rate_limit: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_dedup_keys() -> Vec<String> {
    vec!["code".to_string(), "trade_date".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_rate_limit() -> f64 {
    10.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

impl CollectorConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, DatacenterError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DatacenterError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, DatacenterError> {
        serde_yaml::from_str(raw).map_err(|e| {
            DatacenterError::configuration(format!("malformed collector config: {e}"))
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, DatacenterError> {
        serde_json::from_str(raw).map_err(|e| {
            DatacenterError::configuration(format!("malformed collector config: {e}"))
        })
    }

    /// Expand the declarative `field_mapping` into rules.
    pub fn build_field_mapping(&self) -> Result<FieldMapping, DatacenterError> {
        let mut mapping = FieldMapping::new(self.source.as_str(), self.data_type.as_str());

        for (source_field, target_spec) in &self.field_mapping {
            let rule = match target_spec {
                Value::String(target) => FieldRule::raw(source_field, target),
                Value::Object(spec) => {
                    let target = spec
                        .get("target")
                        .and_then(Value::as_str)
                        .unwrap_or(source_field);
                    let field_type = match spec.get("type").and_then(Value::as_str) {
                        Some(name) => serde_json::from_value::<FieldType>(Value::String(
                            name.to_string(),
                        ))
                        .map_err(|_| {
                            DatacenterError::configuration_key(
                                format!("unknown field type '{name}'"),
                                source_field.clone(),
                            )
                        })?,
                        None => FieldType::Raw,
                    };

                    let mut rule = FieldRule::typed(source_field, target, field_type);
                    if let Some(default) = spec.get("default") {
                        rule = rule.with_default(default.clone());
                    }
                    if let Some(name) = spec.get("converter").and_then(Value::as_str) {
                        let converter = BuiltinConverter::from_name(name).ok_or_else(|| {
                            DatacenterError::configuration_key(
                                format!("unknown converter '{name}'"),
                                source_field.clone(),
                            )
                        })?;
                        rule = rule.with_converter(converter);
                    }
                    if spec.get("required").and_then(Value::as_bool).unwrap_or(false) {
                        rule = rule.required();
                    }
                    rule
                }
                other => {
                    return Err(DatacenterError::configuration_key(
                        format!("field mapping entry must be string or object, got {other}"),
                        source_field.clone(),
                    ))
                }
            };
            mapping = mapping.rule(rule);
        }

        Ok(mapping)
    }
}

/// `RecordFetcher` built from a [`CollectorConfig`].
pub struct ConfigDrivenFetcher {
    config: CollectorConfig,
    source_settings: Option<SourceSettings>,
    mapping_registry: Arc<FieldMappingRegistry>,
    client: ArcSwapOption<HttpClient>,
}

impl ConfigDrivenFetcher {
    pub fn new(
        config: CollectorConfig,
        source_settings: Option<SourceSettings>,
        mapping_registry: Arc<FieldMappingRegistry>,
    ) -> Result<Self, DatacenterError> {
        mapping_registry.register(config.build_field_mapping()?);
        Ok(Self {
            config,
            source_settings,
            mapping_registry,
            client: ArcSwapOption::empty(),
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn build_client(&self) -> Result<Arc<HttpClient>, DatacenterError> {
        let retry_policy = RetryPolicy::new(
            self.config.max_retries,
            Duration::from_secs_f64(self.config.retry_delay),
        );
        let rate_limit = RateLimitPolicy::per_second(self.config.rate_limit);

        let client = HttpClient::new(
            retry_policy,
            Some(rate_limit),
            self.config.request.headers.clone(),
            Duration::from_secs_f64(self.config.request.timeout),
        )?;
        Ok(Arc::new(client))
    }

    fn client(&self) -> Result<Arc<HttpClient>, DatacenterError> {
        if let Some(client) = self.client.load_full() {
            return Ok(client);
        }
        let client = self.build_client()?;
        self.client.store(Some(client.clone()));
        Ok(client)
    }

    fn build_url(&self, params: &CollectParams) -> String {
        substitute_placeholders(&self.config.request.url, params)
    }

    fn build_params(&self, params: &CollectParams) -> Vec<(String, String)> {
        // Static params may carry `{placeholder}` slots too, e.g. filter
        // expressions keyed on a code.
        let mut query: Vec<(String, String)> = self
            .config
            .request
            .params
            .iter()
            .map(|(k, v)| (k.clone(), substitute_placeholders(&render_param(v), params)))
            .collect();

        for (key, value) in params.iter() {
            if matches!(key.as_str(), "symbols" | "start_date" | "end_date") {
                continue;
            }
            query.push((key.clone(), render_param(value)));
        }

        if let Some(symbols) = params.symbols() {
            query.push(("symbols".to_string(), symbols.join(",")));
        }
        if let Some(start) = params.get_string("start_date") {
            query.push(("start_date".to_string(), start));
        }
        if let Some(end) = params.get_string("end_date") {
            query.push(("end_date".to_string(), end));
        }

        query
    }

    fn build_headers(&self) -> HashMap<String, String> {
        let mut headers = self.config.request.headers.clone();
        self.config
            .auth
            .apply(&mut headers, self.source_settings.as_ref());
        headers
    }

    /// Realtime snapshots carry no trade date of their own; records keyed on
    /// `trade_date` get the collection date so natural keys are complete.
    fn stamp_collection_date(&self, records: &mut [Record]) {
        let keyed_on_date = self.config.dedup_keys.iter().any(|k| k == "trade_date");
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();

        for record in records.iter_mut() {
            if keyed_on_date {
                let missing = record
                    .get("trade_date")
                    .map(|v| v.is_null())
                    .unwrap_or(true);
                if missing {
                    record.insert("trade_date".to_string(), Value::String(today.clone()));
                }
            }
            record
                .entry("collected_at".to_string())
                .or_insert_with(|| Value::String(now.clone()));
        }
    }
}

fn render_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn substitute_placeholders(template: &str, params: &CollectParams) -> String {
    if !template.contains('{') {
        return template.to_string();
    }
    let mut rendered = template.to_string();
    for (key, _) in params.iter() {
        let placeholder = format!("{{{key}}}");
        if rendered.contains(&placeholder) {
            if let Some(value) = params.get_string(key) {
                rendered = rendered.replace(&placeholder, &value);
            }
        }
    }
    rendered
}

#[async_trait]
impl RecordFetcher for ConfigDrivenFetcher {
    async fn initialize(&self) -> Result<(), DatacenterError> {
        self.client.store(Some(self.build_client()?));
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), DatacenterError> {
        self.client.store(None);
        Ok(())
    }

    async fn fetch(&self, params: &CollectParams) -> Result<Vec<Record>, DatacenterError> {
        let client = self.client()?;

        let url = self.build_url(params);
        let query = self.build_params(params);
        let headers = self.build_headers();

        let request = match self.config.request.method {
            RequestType::Get => HttpRequest::get(&url).with_params(query),
            RequestType::Post => {
                let mut request = HttpRequest::post(&url).with_params(query);
                if let Some(body) = &self.config.request.body {
                    request = request.with_json(body.clone());
                }
                request
            }
        }
        .with_headers(headers);

        let response = client.request(request).await?;
        if !response.ok() {
            return Err(DatacenterError::network_status(
                format!("request failed with status {}", response.status),
                url,
                response.status,
            ));
        }

        let Some(body) = response.json.as_ref() else {
            return Ok(Vec::new());
        };

        if let Some(message) = self.config.parser.check_error(body) {
            return Err(DatacenterError::external(
                message,
                self.config.source.as_str(),
            ));
        }

        let raw = self.config.parser.parse(body);
        let mut mapped = self.mapping_registry.apply_batch(
            self.config.source.as_str(),
            self.config.data_type.as_str(),
            &raw,
        );
        self.stamp_collection_date(&mut mapped);
        Ok(mapped)
    }

    fn record_hash(&self, record: &Record) -> String {
        record_hash_for_keys(record, &self.config.dedup_keys)
    }

    fn is_valid(&self, record: &Record) -> bool {
        self.config
            .required_fields
            .iter()
            .all(|field| record.get(field).map(|v| !v.is_null()).unwrap_or(false))
    }
}

/// Collector assembled from declarative config.
pub type ConfigDrivenCollector = Collector<ConfigDrivenFetcher>;

impl ConfigDrivenCollector {
    pub fn from_config(
        config: CollectorConfig,
        source_settings: Option<SourceSettings>,
        mapping_registry: Arc<FieldMappingRegistry>,
    ) -> Result<Self, DatacenterError> {
        let mut collection_config = CollectionConfig::new(config.source, config.data_type);
        collection_config.frequency = config.frequency;
        collection_config.retry_count = config.max_retries;
        collection_config.retry_delay = Duration::from_secs_f64(config.retry_delay);
        collection_config.enable_deduplication = config.dedup_enabled;
        collection_config.timeout = Duration::from_secs_f64(config.request.timeout);

        let fetcher = ConfigDrivenFetcher::new(config, source_settings, mapping_registry)?;
        Ok(Collector::new(fetcher, collection_config))
    }
}
