//! Field mapping registry.
//!
//! Transforms raw source records into canonical records declaratively. A
//! mapping is a `(source, data_type)`-keyed bundle of rules; each rule moves
//! one source field to one target field through a typed coercion or a named
//! converter. Registration swaps an immutable snapshot so readers never
//! block.

use arc_swap::ArcSwap;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::core::codes;
use crate::core::convert;
use crate::core::errors::DatacenterError;
use crate::models::Record;

/// Target types a mapped field can coerce to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Decimal,
    Date,
    Datetime,
    Boolean,
    Percentage,
    #[default]
    Raw,
}

/// Named converters usable from declarative configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinConverter {
    SafeFloat,
    SafeInt,
    SafeStr,
    ToDate,
    ToEastmoneyCode,
    NormalizeCode,
}

impl BuiltinConverter {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "safe_float" => Some(Self::SafeFloat),
            "safe_int" => Some(Self::SafeInt),
            "safe_str" => Some(Self::SafeStr),
            "to_date" => Some(Self::ToDate),
            "to_eastmoney_code" => Some(Self::ToEastmoneyCode),
            "normalize_code" => Some(Self::NormalizeCode),
            _ => None,
        }
    }

    fn apply(&self, value: &Value) -> Value {
        match self {
            Self::SafeFloat => convert::to_float(value, None)
                .map(into_number)
                .unwrap_or(Value::Null),
            Self::SafeInt => convert::to_int(value, None)
                .map(Value::from)
                .unwrap_or(Value::Null),
            Self::SafeStr => convert::to_str(value, None)
                .map(Value::String)
                .unwrap_or(Value::Null),
            Self::ToDate => convert::to_date(value, None)
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            Self::ToEastmoneyCode => convert::to_str(value, None)
                .map(|s| Value::String(codes::to_eastmoney_format(&s)))
                .unwrap_or(Value::Null),
            Self::NormalizeCode => convert::to_str(value, None)
                .map(|s| Value::String(codes::normalize(&s)))
                .unwrap_or(Value::Null),
        }
    }
}

fn into_number(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// One source-field → target-field rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub converter: Option<BuiltinConverter>,
    #[serde(default)]
    pub required: bool,
}

impl FieldRule {
    pub fn raw(source_field: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_field: source_field.into(),
            target_field: target_field.into(),
            field_type: FieldType::Raw,
            default: None,
            converter: None,
            required: false,
        }
    }

    pub fn typed(
        source_field: impl Into<String>,
        target_field: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        Self {
            field_type,
            ..Self::raw(source_field, target_field)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_converter(mut self, converter: BuiltinConverter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Apply this rule to one source record.
    fn apply(&self, source: &Record) -> Result<(String, Value), DatacenterError> {
        let value = source.get(&self.source_field);

        let value = match value {
            None | Some(Value::Null) => {
                if self.required && self.default.is_none() {
                    return Err(DatacenterError::validation_field(
                        format!("required field '{}' is missing", self.source_field),
                        self.source_field.clone(),
                    ));
                }
                return Ok((
                    self.target_field.clone(),
                    self.default.clone().unwrap_or(Value::Null),
                ));
            }
            Some(v) => v,
        };

        let converted = match self.converter {
            Some(converter) => converter.apply(value),
            None => self.convert_by_type(value),
        };

        let converted = if converted.is_null() {
            self.default.clone().unwrap_or(Value::Null)
        } else {
            converted
        };

        Ok((self.target_field.clone(), converted))
    }

    fn convert_by_type(&self, value: &Value) -> Value {
        match self.field_type {
            FieldType::Raw => value.clone(),
            FieldType::String => convert::to_str(value, None)
                .map(Value::String)
                .unwrap_or(Value::Null),
            FieldType::Integer => convert::to_int(value, None)
                .map(Value::from)
                .unwrap_or(Value::Null),
            FieldType::Float => convert::to_float(value, None)
                .map(into_number)
                .unwrap_or(Value::Null),
            FieldType::Decimal => convert::to_decimal(value, None)
                .map(|d| Value::String(d.normalize().to_string()))
                .unwrap_or(Value::Null),
            FieldType::Date => convert::to_date(value, None)
                .map(|d: NaiveDate| Value::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            FieldType::Datetime => convert::to_datetime(value, None)
                .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()))
                .unwrap_or(Value::Null),
            FieldType::Boolean => convert::to_bool(value, None)
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            FieldType::Percentage => convert::to_percent(value, None, true)
                .map(into_number)
                .unwrap_or(Value::Null),
        }
    }
}

pub type PostProcessor = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// Ordered rule bundle for one `(source, data_type)` pair.
#[derive(Clone)]
pub struct FieldMapping {
    pub source: String,
    pub data_type: String,
    pub rules: Vec<FieldRule>,
    pub post_processor: Option<PostProcessor>,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            data_type: data_type.into(),
            rules: Vec::new(),
            post_processor: None,
        }
    }

    pub fn rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn post_process(
        mut self,
        processor: impl Fn(Record) -> Record + Send + Sync + 'static,
    ) -> Self {
        self.post_processor = Some(Arc::new(processor));
        self
    }

    /// Apply every rule in declared order. Unknown source fields are ignored
    /// by construction: only fields named in rules are read.
    pub fn apply(&self, source: &Record) -> Result<Record, DatacenterError> {
        let mut target = Record::new();
        for rule in &self.rules {
            let (field, value) = rule.apply(source)?;
            target.insert(field, value);
        }

        match &self.post_processor {
            Some(processor) => Ok(processor(target)),
            None => Ok(target),
        }
    }
}

impl std::fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldMapping")
            .field("source", &self.source)
            .field("data_type", &self.data_type)
            .field("rules", &self.rules.len())
            .field("post_processor", &self.post_processor.is_some())
            .finish()
    }
}

type MappingKey = (String, String);

/// Central mapping registry.
///
/// Registration clones the current snapshot and swaps in the replacement,
/// so `apply` never takes a lock.
pub struct FieldMappingRegistry {
    mappings: ArcSwap<HashMap<MappingKey, Arc<FieldMapping>>>,
}

impl FieldMappingRegistry {
    pub fn new() -> Self {
        Self {
            mappings: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn register(&self, mapping: FieldMapping) {
        let key = (mapping.source.clone(), mapping.data_type.clone());
        let mut next: HashMap<MappingKey, Arc<FieldMapping>> =
            self.mappings.load().as_ref().clone();
        next.insert(key, Arc::new(mapping));
        self.mappings.store(Arc::new(next));
    }

    /// Register a plain `source_field -> target_field` map (all raw types).
    pub fn register_simple(
        &self,
        source: &str,
        data_type: &str,
        field_map: &[(&str, &str)],
    ) {
        let mut mapping = FieldMapping::new(source, data_type);
        for (source_field, target_field) in field_map {
            mapping = mapping.rule(FieldRule::raw(*source_field, *target_field));
        }
        self.register(mapping);
    }

    pub fn get(&self, source: &str, data_type: &str) -> Option<Arc<FieldMapping>> {
        self.mappings
            .load()
            .get(&(source.to_string(), data_type.to_string()))
            .cloned()
    }

    /// Apply the registered mapping; records with no registered mapping pass
    /// through unchanged.
    pub fn apply(
        &self,
        source: &str,
        data_type: &str,
        record: &Record,
    ) -> Result<Record, DatacenterError> {
        match self.get(source, data_type) {
            Some(mapping) => mapping.apply(record),
            None => Ok(record.clone()),
        }
    }

    /// Apply one record at a time; failures drop the record, not the batch.
    pub fn apply_batch(&self, source: &str, data_type: &str, records: &[Record]) -> Vec<Record> {
        let mapping = self.get(source, data_type);
        records
            .iter()
            .filter_map(|record| {
                let result = match &mapping {
                    Some(mapping) => mapping.apply(record),
                    None => Ok(record.clone()),
                };
                match result {
                    Ok(mapped) => Some(mapped),
                    Err(e) => {
                        warn!(source, data_type, "dropping record: {e}");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn list_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .mappings
            .load()
            .keys()
            .map(|(source, _)| source.clone())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    pub fn list_data_types(&self, source: &str) -> Vec<String> {
        let mut types: Vec<String> = self
            .mappings
            .load()
            .keys()
            .filter(|(s, _)| s == source)
            .map(|(_, data_type)| data_type.clone())
            .collect();
        types.sort();
        types
    }
}

impl Default for FieldMappingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn quote_mapping() -> FieldMapping {
        FieldMapping::new("eastmoney", "stock_quote")
            .rule(FieldRule::typed("f12", "code", FieldType::String).required())
            .rule(FieldRule::typed("f14", "name", FieldType::String))
            .rule(FieldRule::typed("f2", "close", FieldType::Float))
            .rule(FieldRule::typed("f3", "change_pct", FieldType::Float))
            .rule(FieldRule::typed("f5", "volume", FieldType::Integer))
            .rule(FieldRule::typed("f6", "amount", FieldType::Float))
    }

    #[test]
    fn mapping_is_deterministic() {
        let mapping = quote_mapping();
        let source = record(&[
            ("f12", json!("600000")),
            ("f14", json!("Bank A")),
            ("f2", json!("9.87")),
            ("f3", json!(1.2)),
            ("f5", json!(1_000_000)),
            ("f6", json!(9_870_000.0)),
            ("f999", json!("ignored")),
        ]);

        let first = mapping.apply(&source).unwrap();
        let second = mapping.apply(&source).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.get("code").unwrap(), "600000");
        assert_eq!(first.get("close").unwrap().as_f64(), Some(9.87));
        assert_eq!(first.get("volume").unwrap().as_i64(), Some(1_000_000));
        assert!(first.get("f999").is_none());
    }

    #[test]
    fn required_field_without_default_fails() {
        let mapping = quote_mapping();
        let source = record(&[("f14", json!("No Code"))]);
        let err = mapping.apply(&source).unwrap_err();
        assert!(err.to_string().contains("f12"));
    }

    #[test]
    fn defaults_fill_absent_fields() {
        let mapping = FieldMapping::new("s", "t").rule(
            FieldRule::typed("vol", "volume", FieldType::Integer).with_default(json!(0)),
        );
        let mapped = mapping.apply(&record(&[])).unwrap();
        assert_eq!(mapped.get("volume").unwrap().as_i64(), Some(0));

        // Unparseable values also fall back to the default.
        let mapped = mapping.apply(&record(&[("vol", json!("--"))])).unwrap();
        assert_eq!(mapped.get("volume").unwrap().as_i64(), Some(0));
    }

    #[test]
    fn named_converters_run_instead_of_type_coercion() {
        let mapping = FieldMapping::new("s", "t").rule(
            FieldRule::raw("secid", "code").with_converter(BuiltinConverter::NormalizeCode),
        );
        let mapped = mapping.apply(&record(&[("secid", json!("1.600000"))])).unwrap();
        assert_eq!(mapped.get("code").unwrap(), "600000");
    }

    #[test]
    fn percentage_and_date_types() {
        let mapping = FieldMapping::new("s", "t")
            .rule(FieldRule::typed("chg", "change_ratio", FieldType::Percentage))
            .rule(FieldRule::typed("date", "trade_date", FieldType::Date));
        let mapped = mapping
            .apply(&record(&[("chg", json!("5.5%")), ("date", json!("20240603"))]))
            .unwrap();
        assert_eq!(mapped.get("change_ratio").unwrap().as_f64(), Some(0.055));
        assert_eq!(mapped.get("trade_date").unwrap(), "2024-06-03");
    }

    #[test]
    fn post_processor_runs_on_assembled_record() {
        let mapping = FieldMapping::new("s", "t")
            .rule(FieldRule::raw("a", "a"))
            .post_process(|mut record| {
                record.insert("stamped".to_string(), json!(true));
                record
            });
        let mapped = mapping.apply(&record(&[("a", json!(1))])).unwrap();
        assert_eq!(mapped.get("stamped").unwrap(), &json!(true));
    }

    #[test]
    fn batch_apply_drops_bad_records_only() {
        let registry = FieldMappingRegistry::new();
        registry.register(quote_mapping());

        let good = record(&[("f12", json!("600000"))]);
        let bad = record(&[("f14", json!("missing code"))]);
        let mapped = registry.apply_batch("eastmoney", "stock_quote", &[good, bad]);
        assert_eq!(mapped.len(), 1);
    }

    #[test]
    fn unregistered_mapping_passes_records_through() {
        let registry = FieldMappingRegistry::new();
        let source = record(&[("anything", json!(1))]);
        let out = registry.apply("nope", "nope", &source).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn registry_listings() {
        let registry = FieldMappingRegistry::new();
        registry.register(FieldMapping::new("eastmoney", "stock_quote"));
        registry.register(FieldMapping::new("eastmoney", "money_flow"));
        registry.register(FieldMapping::new("sina", "stock_quote"));

        assert_eq!(registry.list_sources(), vec!["eastmoney", "sina"]);
        assert_eq!(
            registry.list_data_types("eastmoney"),
            vec!["money_flow", "stock_quote"]
        );
    }
}
