//! FinData backend library.
//!
//! Financial market data acquisition: configuration-driven collectors over a
//! resilient HTTP layer, declarative field mapping into canonical records,
//! table-config-driven persistence, and a calendar-aware scheduler.

pub mod collector;
pub mod core;
pub mod graph;
pub mod models;
pub mod persistence;
pub mod scheduler;
pub mod task;

pub use crate::collector::{
    CollectionResult, CollectionStatus, Collector, CollectorConfig, ConfigDrivenCollector,
};
pub use crate::core::config::DatacenterConfig;
pub use crate::core::errors::DatacenterError;
pub use crate::core::mapping::FieldMappingRegistry;
pub use crate::core::sources::SourceRegistry;
pub use crate::models::{CollectParams, DataCategory, DataFrequency, DataSource, DataType, Record};
pub use crate::persistence::{ConfigurablePersistence, PersistenceConfig, TableConfig};
pub use crate::scheduler::{CollectionScheduler, ScheduleSpec, ScheduledTask};
pub use crate::task::{TaskRegistry, TradingCalendar};
