//! Task framework: registry, built-in executors, trading calendar.

pub mod calendar;
pub mod executors;
pub mod registry;

pub use calendar::TradingCalendar;
pub use executors::{register_builtin_tasks, CollectorTaskExecutor, TaskContext};
pub use registry::{
    ProgressHandle, TaskCategory, TaskExecutor, TaskMetadata, TaskOutput, TaskParameter,
    TaskPriority, TaskProgress, TaskRegistry, TaskRunSummary, TaskStatus,
};
