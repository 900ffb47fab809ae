//! Data collection framework.
//!
//! `base` holds the collector harness (lifecycle, retry, dedup, validation);
//! `config_driven` builds complete collectors from declarative configs.

pub mod base;
pub mod config_driven;

pub use base::{
    record_hash_for_keys, CollectionConfig, CollectionResult, CollectionStatus, Collector,
    RecordFetcher,
};
pub use config_driven::{
    AuthConfig, AuthType, CollectorConfig, ConfigDrivenCollector, ConfigDrivenFetcher,
    ParserConfig, RequestConfig, RequestType,
};
