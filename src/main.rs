//! findatad - market data acquisition daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use findata_backend::core::config::DatacenterConfig;
use findata_backend::core::errors::{HealthChecker, HealthStatus};
use findata_backend::core::mapping::FieldMappingRegistry;
use findata_backend::core::sources::{SourceCapabilities, SourceConfig, SourceRegistry};
use findata_backend::models::{CollectParams, DataFrequency, DataType};
use findata_backend::persistence::{ConfigurablePersistence, PersistenceConfig};
use findata_backend::scheduler::{CollectionScheduler, ScheduleSpec, ScheduledTask};
use findata_backend::task::registry::{ProgressHandle, TaskRegistry};
use findata_backend::task::{register_builtin_tasks, TaskContext};

#[derive(Parser)]
#[command(name = "findatad", about = "Market data acquisition daemon")]
struct Cli {
    /// Datacenter configuration file.
    #[arg(long, env = "DATACENTER_CONFIG", default_value = "config/datacenter.yaml")]
    config: PathBuf,

    /// Persistence (table) configuration file.
    #[arg(
        long,
        env = "DATACENTER_PERSISTENCE_CONFIG",
        default_value = "config/persistence.yaml"
    )]
    persistence_config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon.
    Run,
    /// Execute one task to completion and print the summary.
    Task {
        task_type: String,
        /// Task parameters as key=value pairs.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// List registered tasks.
    ListTasks {
        #[arg(long)]
        category: Option<String>,
    },
    /// Print component health.
    Health,
}

struct App {
    config: DatacenterConfig,
    persistence: Arc<ConfigurablePersistence>,
    sources: Arc<SourceRegistry>,
    tasks: Arc<TaskRegistry>,
}

impl App {
    fn bootstrap(cli: &Cli) -> Result<Self> {
        let config = if cli.config.exists() {
            DatacenterConfig::from_yaml_file(&cli.config)?
        } else {
            info!(path = %cli.config.display(), "config file missing, using defaults");
            DatacenterConfig::default()
        };

        let mut persistence_config = if cli.persistence_config.exists() {
            PersistenceConfig::from_yaml_file(&cli.persistence_config)?
        } else {
            PersistenceConfig::default()
        };
        persistence_config.database_url = config.storage.resolve_database_url();
        let persistence = Arc::new(ConfigurablePersistence::new(persistence_config)?);

        let sources = Arc::new(SourceRegistry::new());
        for (source_id, settings) in config.enabled_sources() {
            sources.register(
                SourceConfig {
                    source_id: source_id.clone(),
                    name: source_id.clone(),
                    base_url: settings.base_url.clone(),
                    api_key: settings.api_key.clone(),
                    headers: settings.headers.clone(),
                    timeout: settings.timeout,
                    retry_count: settings.retry_count,
                },
                Some(SourceCapabilities {
                    data_types: vec![DataType::StockQuote],
                    frequencies: vec![DataFrequency::Daily, DataFrequency::Tick],
                    supports_realtime: true,
                    rate_limit_per_second: settings.rate_limit,
                    requires_auth: settings.api_key.is_some(),
                    ..Default::default()
                }),
            );
        }

        let tasks = Arc::new(TaskRegistry::new());
        let context = TaskContext {
            persistence: persistence.clone(),
            mapping_registry: Arc::new(FieldMappingRegistry::new()),
            datacenter: config.clone(),
        };
        register_builtin_tasks(&tasks, &context)?;

        Ok(Self {
            config,
            persistence,
            sources,
            tasks,
        })
    }
}

fn parse_params(pairs: &[String]) -> Result<CollectParams> {
    let mut params = CollectParams::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("parameter '{pair}' is not KEY=VALUE"))?;
        // Values parse as JSON when possible, otherwise stay strings.
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,findata_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app = App::bootstrap(&cli).context("startup failed")?;

    match &cli.command {
        Command::Run => run_daemon(&app).await,
        Command::Task { task_type, params } => run_single_task(&app, task_type, params).await,
        Command::ListTasks { category } => {
            let category = match category.as_deref() {
                Some(c) => Some(
                    serde_json::from_value::<findata_backend::task::TaskCategory>(json!(c))
                        .context("unknown category")?,
                ),
                None => None,
            };
            for metadata in app.tasks.list_tasks(category) {
                println!(
                    "{:<24} {:<12} {:<10} {}",
                    metadata.task_type,
                    metadata.category.as_str(),
                    format!("{:?}", metadata.priority).to_lowercase(),
                    metadata.name
                );
            }
            Ok(())
        }
        Command::Health => {
            let checker = build_health_checker(&app);
            let overall = checker.overall_health();
            println!("{}", serde_json::to_string_pretty(&overall)?);
            println!(
                "sources: {}",
                serde_json::to_string_pretty(&app.sources.summary())?
            );
            println!(
                "storage: {}",
                serde_json::to_string_pretty(&app.persistence.stats())?
            );
            Ok(())
        }
    }
}

async fn run_daemon(app: &App) -> Result<()> {
    let scheduler = CollectionScheduler::new(
        app.tasks.clone(),
        app.config.collection.max_concurrent,
    );

    // Market snapshot after every close, news on a short poll loop, macro
    // series weekly in the background.
    scheduler.add_task(ScheduledTask::new(
        "stock-list-daily",
        "stock_list",
        ScheduleSpec::TradingDaily(chrono::NaiveTime::from_hms_opt(15, 30, 0).unwrap()),
    ));
    scheduler.add_task(
        ScheduledTask::new(
            "money-flow-daily",
            "daily_money_flow",
            ScheduleSpec::TradingDaily(chrono::NaiveTime::from_hms_opt(16, 0, 0).unwrap()),
        )
        .depends_on("stock-list-daily"),
    );
    scheduler.add_task(ScheduledTask::new(
        "news-poll",
        "news_feed",
        ScheduleSpec::Interval(std::time::Duration::from_secs(300)),
    ));
    scheduler.add_task(ScheduledTask::new(
        "macro-money-supply",
        "macro_money_supply",
        ScheduleSpec::cron("0 0 6 * * Mon *").map_err(anyhow::Error::from)?,
    ));

    let runner = tokio::spawn(scheduler.clone().run());
    info!("daemon running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    scheduler.shutdown();
    runner.await?;
    Ok(())
}

async fn run_single_task(app: &App, task_type: &str, raw_params: &[String]) -> Result<()> {
    let executor = app
        .tasks
        .executor(task_type)
        .with_context(|| format!("unknown task type '{task_type}'"))?;

    let params = parse_params(raw_params)?;
    let progress = ProgressHandle::new(format!("cli_{task_type}"));
    let summary = executor.execute(&params, &progress).await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.success {
        anyhow::bail!("task failed");
    }
    Ok(())
}

fn build_health_checker(app: &App) -> HealthChecker {
    let checker = HealthChecker::new();

    let persistence = app.persistence.clone();
    checker.register_check("storage", move || {
        match persistence.query_rows("SELECT 1 AS ok") {
            Ok(_) => HealthStatus::healthy("storage", "database reachable"),
            Err(e) => HealthStatus::unhealthy("storage", e.to_string()),
        }
    });

    let sources = app.sources.clone();
    checker.register_check("sources", move || {
        let available = sources.list_available_sources().len();
        if available > 0 || sources.list_sources().is_empty() {
            HealthStatus::healthy("sources", format!("{available} sources available"))
        } else {
            HealthStatus::unhealthy("sources", "all sources unavailable")
        }
    });

    checker
}
