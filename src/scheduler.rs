//! Collection scheduler.
//!
//! Dispatches registered tasks on interval, daily, trading-day or cron
//! schedules. A global semaphore bounds concurrent workers; a per-task
//! running guard keeps at most one execution of a task id in flight.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime};
use cron::Schedule;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use crate::core::errors::DatacenterError;
use crate::models::CollectParams;
use crate::task::calendar::TradingCalendar;
use crate::task::registry::{ProgressHandle, TaskRegistry};

/// How failed runs are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    Immediate,
    Linear,
    #[default]
    Exponential,
}

impl RetryStrategy {
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::Linear => base.saturating_mul(attempt + 1),
            RetryStrategy::Exponential => {
                Duration::from_secs_f64(base.as_secs_f64() * 2f64.powi(attempt as i32))
            }
        }
    }
}

/// When a task fires.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// Every fixed interval.
    Interval(Duration),
    /// Every day at a local wall-clock time.
    Daily(NaiveTime),
    /// Every trading day at a local wall-clock time.
    TradingDaily(NaiveTime),
    /// Cron expression (seconds granularity).
    Cron(Schedule),
}

impl ScheduleSpec {
    pub fn cron(expr: &str) -> Result<Self, DatacenterError> {
        Schedule::from_str(expr)
            .map(ScheduleSpec::Cron)
            .map_err(|e| {
                DatacenterError::configuration(format!("invalid cron expression '{expr}': {e}"))
            })
    }

    /// Next fire time strictly after `after`.
    pub fn next_run(
        &self,
        after: DateTime<Local>,
        calendar: &TradingCalendar,
    ) -> Option<DateTime<Local>> {
        match self {
            ScheduleSpec::Interval(interval) => {
                Some(after + ChronoDuration::from_std(*interval).ok()?)
            }
            ScheduleSpec::Daily(time) => next_daily(after, *time, None),
            ScheduleSpec::TradingDaily(time) => next_daily(after, *time, Some(calendar)),
            ScheduleSpec::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

fn next_daily(
    after: DateTime<Local>,
    time: NaiveTime,
    calendar: Option<&TradingCalendar>,
) -> Option<DateTime<Local>> {
    let mut date = after.date_naive();
    // Bounded by the longest holiday stretch plus weekends.
    for _ in 0..60 {
        let trading_ok = calendar.map(|c| c.is_trading_day(date)).unwrap_or(true);
        if trading_ok {
            if let Some(candidate) = date
                .and_time(time)
                .and_local_timezone(Local)
                .single()
                .filter(|c| *c > after)
            {
                return Some(candidate);
            }
        }
        date += ChronoDuration::days(1);
    }
    None
}

/// One scheduled task.
#[derive(Clone)]
pub struct ScheduledTask {
    pub task_id: String,
    pub task_type: String,
    pub params: CollectParams,
    pub schedule: ScheduleSpec,
    pub max_retries: u32,
    pub retry_strategy: RetryStrategy,
    pub retry_delay: Duration,
    /// The named task's most recent run must have succeeded before this one
    /// fires.
    pub depends_on: Option<String>,
    pub enabled: bool,
}

impl ScheduledTask {
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        schedule: ScheduleSpec,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            params: CollectParams::new(),
            schedule,
            max_retries: 3,
            retry_strategy: RetryStrategy::Exponential,
            retry_delay: Duration::from_secs(1),
            depends_on: None,
            enabled: true,
        }
    }

    pub fn with_params(mut self, params: CollectParams) -> Self {
        self.params = params;
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on = Some(task_id.into());
        self
    }

    pub fn retries(mut self, max_retries: u32, strategy: RetryStrategy) -> Self {
        self.max_retries = max_retries;
        self.retry_strategy = strategy;
        self
    }
}

/// Mutable per-task scheduler state.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub running: bool,
    pub next_run: Option<DateTime<Local>>,
    pub last_run: Option<DateTime<Local>>,
    pub last_success: Option<DateTime<Local>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_runs: u64,
}

impl TaskState {
    fn new(next_run: Option<DateTime<Local>>) -> Self {
        Self {
            running: false,
            next_run,
            last_run: None,
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
            total_runs: 0,
        }
    }

    /// The most recent completed run succeeded.
    fn last_run_succeeded(&self) -> bool {
        self.last_success.is_some() && self.consecutive_failures == 0
    }
}

/// Calendar-aware task dispatcher.
pub struct CollectionScheduler {
    registry: Arc<TaskRegistry>,
    calendar: TradingCalendar,
    workers: Arc<Semaphore>,
    tasks: RwLock<HashMap<String, ScheduledTask>>,
    states: RwLock<HashMap<String, TaskState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CollectionScheduler {
    pub fn new(registry: Arc<TaskRegistry>, max_workers: usize) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            registry,
            calendar: TradingCalendar::new(),
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            tasks: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// Add (or replace) a scheduled task. The first fire time is computed
    /// from now.
    pub fn add_task(&self, task: ScheduledTask) {
        let next = task.schedule.next_run(Local::now(), &self.calendar);
        info!(
            task_id = task.task_id,
            task_type = task.task_type,
            next_run = next.map(|t| t.to_rfc3339()),
            "scheduled task"
        );
        self.states
            .write()
            .insert(task.task_id.clone(), TaskState::new(next));
        self.tasks.write().insert(task.task_id.clone(), task);
    }

    pub fn remove_task(&self, task_id: &str) {
        self.tasks.write().remove(task_id);
        self.states.write().remove(task_id);
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.states.read().get(task_id).cloned()
    }

    pub fn summary(&self) -> serde_json::Value {
        let states = self.states.read();
        json!(states
            .iter()
            .map(|(id, state)| {
                (
                    id.clone(),
                    json!({
                        "running": state.running,
                        "next_run": state.next_run.map(|t| t.to_rfc3339()),
                        "last_success": state.last_success.map(|t| t.to_rfc3339()),
                        "consecutive_failures": state.consecutive_failures,
                        "total_runs": state.total_runs,
                    }),
                )
            })
            .collect::<HashMap<String, serde_json::Value>>())
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send(true).ok();
    }

    /// Dispatch loop. Runs until `shutdown`, then drains in-flight tasks.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("scheduler started");
        loop {
            tokio::select! {
                _ = tick.tick() => Self::dispatch_due(&self),
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain: wait for in-flight tasks to finish.
        while self.states.read().values().any(|s| s.running) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("scheduler stopped");
    }

    /// Fire every due task whose dependency gate is open.
    fn dispatch_due(scheduler: &Arc<Self>) {
        let now = Local::now();
        let due: Vec<ScheduledTask> = {
            let tasks = scheduler.tasks.read();
            let states = scheduler.states.read();
            tasks
                .values()
                .filter(|task| task.enabled)
                .filter(|task| {
                    states
                        .get(&task.task_id)
                        .map(|s| !s.running && s.next_run.map(|n| n <= now).unwrap_or(false))
                        .unwrap_or(false)
                })
                .filter(|task| scheduler.dependency_satisfied(task, &states))
                .cloned()
                .collect()
        };

        for task in due {
            Self::spawn_task(scheduler, task, now);
        }
    }

    fn dependency_satisfied(
        &self,
        task: &ScheduledTask,
        states: &HashMap<String, TaskState>,
    ) -> bool {
        match &task.depends_on {
            None => true,
            Some(dep) => states
                .get(dep)
                .map(|s| s.last_run_succeeded())
                .unwrap_or(false),
        }
    }

    fn spawn_task(scheduler: &Arc<Self>, task: ScheduledTask, now: DateTime<Local>) {
        {
            let mut states = scheduler.states.write();
            let Some(state) = states.get_mut(&task.task_id) else {
                return;
            };
            state.running = true;
            state.next_run = task.schedule.next_run(now, &scheduler.calendar);
        }

        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let _permit = scheduler
                .workers
                .acquire()
                .await
                .expect("worker semaphore closed");
            scheduler.run_task(&task).await;
        });
    }

    /// Trigger one task immediately, outside its schedule. Respects the
    /// single-flight guard.
    pub async fn trigger_now(&self, task_id: &str) -> Result<(), DatacenterError> {
        let task = self
            .tasks
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| DatacenterError::configuration(format!("unknown task '{task_id}'")))?;

        {
            let mut states = self.states.write();
            let state = states
                .get_mut(task_id)
                .ok_or_else(|| DatacenterError::internal("task state missing"))?;
            if state.running {
                return Err(DatacenterError::validation(format!(
                    "task '{task_id}' is already running"
                )));
            }
            state.running = true;
        }

        let _permit = self
            .workers
            .acquire()
            .await
            .expect("worker semaphore closed");
        self.run_task(&task).await;
        Ok(())
    }

    /// Execute one task with per-run retries, then record the outcome.
    async fn run_task(&self, task: &ScheduledTask) {
        let Some(executor) = self.registry.executor(&task.task_type) else {
            warn!(
                task_id = task.task_id,
                task_type = task.task_type,
                "no executor registered"
            );
            self.finish_task(task, Some("no executor registered".to_string()));
            return;
        };

        let mut last_error: Option<String> = None;
        for attempt in 0..=task.max_retries {
            let progress = ProgressHandle::new(format!(
                "{}_{}",
                task.task_id,
                Local::now().format("%Y%m%d%H%M%S")
            ));
            let summary = executor.execute(&task.params, &progress).await;
            if summary.success {
                last_error = None;
                break;
            }

            last_error = summary.error;
            if attempt < task.max_retries {
                let delay = task.retry_strategy.delay(task.retry_delay, attempt);
                warn!(
                    task_id = task.task_id,
                    attempt = attempt + 1,
                    "task failed, retrying in {:.1}s",
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
        }

        self.finish_task(task, last_error);
    }

    fn finish_task(&self, task: &ScheduledTask, error: Option<String>) {
        let mut states = self.states.write();
        let Some(state) = states.get_mut(&task.task_id) else {
            return;
        };
        state.running = false;
        state.last_run = Some(Local::now());
        state.total_runs += 1;
        match error {
            None => {
                state.last_success = Some(Local::now());
                state.consecutive_failures = 0;
                state.last_error = None;
            }
            Some(message) => {
                state.consecutive_failures += 1;
                state.last_error = Some(message);
            }
        }
    }
}
