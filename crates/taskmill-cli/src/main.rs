use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use taskmill_core::app::{App, AppBuilder, open_store};
use taskmill_core::config::{StoreBackend, TaskmillConfig};
use taskmill_core::control::{LogSink, Operation, OptimizeOptions};
use taskmill_core::domain::{NewTask, TaskId, TaskStatus};
use taskmill_core::monitor::ExportFilter;
use taskmill_core::typed::{
    AiAnalysis, Handler, HandlerError, HandlerResult, Notification, RuleDistribution, Task,
};

#[derive(Debug, Parser)]
#[command(name = "taskmill", version, about = "Task queue, queue monitor and capacity controller")]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Store backend, overriding the config file.
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Redis URL, overriding the config file. Selects the redis backend.
    #[arg(long, env = "TASKMILL_REDIS_URL")]
    redis_url: Option<String>,

    /// Redis key prefix.
    #[arg(long)]
    prefix: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueue a task.
    Push {
        task_type: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,
        #[arg(long)]
        max_retry: Option<u32>,
    },
    /// Show a task record by id or subject.
    Status { key: String },
    /// Show the outcome of a task by id or subject.
    Result { key: String },
    /// Re-enqueue failed tasks.
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Mark tasks as skipped.
    Skip {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Cancel tasks.
    Cancel {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Queue metrics; every queue when none is given.
    Metrics { queue: Option<String> },
    /// Metrics for one task type.
    TaskMetrics { task_type: String },
    /// Evaluate health for every queue.
    Health,
    /// List alerts.
    Alerts,
    /// Acknowledge an alert.
    AckAlert {
        alert_id: String,
        #[arg(long, default_value = "operator")]
        by: String,
    },
    Pause { queue: String },
    Resume { queue: String },
    /// Worker recommendation for a queue.
    Recommend { queue: String },
    /// Run maintenance operations on a queue.
    Optimize {
        queue: String,
        /// Operations to run (autoscale, cleanup, rebalance, tune_workers). All when omitted.
        #[arg(long = "op")]
        operations: Vec<Operation>,
        #[arg(long)]
        current_workers: Option<usize>,
        #[arg(long)]
        cleanup_max_age_hours: Option<u64>,
    },
    /// Remove finished tasks older than the given age.
    Cleanup {
        queue: String,
        #[arg(long, default_value_t = 168)]
        max_age_hours: u64,
    },
    /// Export task records as JSON.
    Export {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        task_type: Option<String>,
        #[arg(long)]
        created_after: Option<DateTime<Utc>>,
        #[arg(long)]
        created_before: Option<DateTime<Utc>>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run workers and the control loop against sample tasks.
    Demo {
        #[arg(long, default_value_t = 40)]
        tasks: usize,
        /// Stop after this many seconds; ctrl-c also stops.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let config = load_config(&cli)?;
    let app = build_app(config, matches!(cli.command, Command::Demo { .. })).await?;

    run(&app, cli.command).await
}

fn init_logging(format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("failed to initialise json logging")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .context("failed to initialise logging")?,
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<TaskmillConfig> {
    let mut config = match &cli.config {
        Some(path) => TaskmillConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TaskmillConfig::default(),
    };

    if let Some(url) = &cli.redis_url {
        config.store.url = url.clone();
        config.store.backend = StoreBackend::Redis;
    }
    if let Some(prefix) = &cli.prefix {
        config.store.key_prefix = prefix.clone();
    }
    match cli.backend {
        Some(Backend::Memory) => config.store.backend = StoreBackend::Memory,
        Some(Backend::Redis) => config.store.backend = StoreBackend::Redis,
        None => {}
    }
    Ok(config)
}

async fn build_app(config: TaskmillConfig, demo: bool) -> Result<App> {
    let store = if demo {
        // the demo never touches shared state
        open_store(&Default::default()).await?
    } else {
        if config.store.backend == StoreBackend::Memory {
            warn!("memory backend selected; state is lost when this command exits");
        }
        open_store(&config.store)
            .await
            .with_context(|| format!("failed to open store at {}", config.store.url))?
    };

    let app = AppBuilder::new(config)
        .with_store(store)
        .register::<AiAnalysis, _>(DemoAnalyzer)?
        .register::<Notification, _>(DemoNotifier)?
        .register::<RuleDistribution, _>(DemoDistributor)?
        .expect_tasks(&[AiAnalysis::TYPE, Notification::TYPE, RuleDistribution::TYPE])
        .build()?;
    Ok(app)
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Push {
            task_type,
            payload,
            subject,
            id,
            queue,
            priority,
            max_retry,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut task = NewTask::new(task_type, payload).with_priority(priority);
            if let Some(subject) = subject {
                task = task.with_subject(subject);
            }
            if let Some(id) = id {
                task = task.with_id(id);
            }
            if let Some(queue) = queue {
                task = task.with_queue(queue);
            }
            if let Some(max_retry) = max_retry {
                task = task.with_max_retry(max_retry);
            }
            print_json(&app.queue.push(task).await?)
        }
        Command::Status { key } => match app.queue.get_task_status(&key).await? {
            Some(record) => print_json(&record),
            None => bail!("task {key} not found"),
        },
        Command::Result { key } => print_json(&app.queue.get_result(&key).await?),
        Command::Retry { ids } => print_json(&app.queue.retry_many(&task_ids(ids)).await),
        Command::Skip { ids } => print_json(&app.queue.skip_many(&task_ids(ids)).await),
        Command::Cancel { ids } => print_json(&app.queue.cancel_many(&task_ids(ids)).await),
        Command::Metrics { queue: Some(queue) } => {
            print_json(&app.monitor.get_queue_metrics(&queue).await?)
        }
        Command::Metrics { queue: None } => print_json(&app.monitor.get_all_queue_metrics().await?),
        Command::TaskMetrics { task_type } => {
            print_json(&app.monitor.get_task_metrics(&task_type).await?)
        }
        Command::Health => print_json(&app.monitor.get_health_status().await?),
        Command::Alerts => print_json(&app.monitor.list_alerts().await?),
        Command::AckAlert { alert_id, by } => {
            print_json(&app.monitor.acknowledge_alert(&alert_id, &by).await?)
        }
        Command::Pause { queue } => {
            app.controller.pause(&queue).await?;
            print_json(&serde_json::json!({ "queue": queue, "paused": true }))
        }
        Command::Resume { queue } => {
            app.controller.resume(&queue).await?;
            print_json(&serde_json::json!({ "queue": queue, "paused": false }))
        }
        Command::Recommend { queue } => print_json(&app.controller.recommend(&queue).await?),
        Command::Optimize {
            queue,
            operations,
            current_workers,
            cleanup_max_age_hours,
        } => {
            let mut options = if operations.is_empty() {
                OptimizeOptions::default()
            } else {
                OptimizeOptions::only(&operations)
            };
            options.current_workers = current_workers;
            if let Some(hours) = cleanup_max_age_hours {
                options.cleanup_max_age = hours_to_duration(hours);
            }
            print_json(&app.controller.optimize(&queue, &options).await)
        }
        Command::Cleanup {
            queue,
            max_age_hours,
        } => print_json(
            &app.monitor
                .cleanup_expired_tasks(&queue, hours_to_duration(max_age_hours))
                .await?,
        ),
        Command::Export {
            queue,
            status,
            task_type,
            created_after,
            created_before,
            limit,
        } => {
            let filter = ExportFilter {
                queue,
                status,
                task_type,
                created_after,
                created_before,
                limit,
            };
            print_json(&app.monitor.export_tasks(&filter).await?)
        }
        Command::Demo { tasks, seconds } => demo(app, tasks, Duration::from_secs(seconds)).await,
    }
}

fn task_ids(ids: Vec<String>) -> Vec<TaskId> {
    ids.into_iter().map(TaskId::from).collect()
}

fn hours_to_duration(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}

async fn demo(app: &App, tasks: usize, run_for: Duration) -> Result<()> {
    let queue_name = app.queue.config().default_queue.clone();
    for i in 0..tasks {
        let task = match i % 3 {
            0 => AiAnalysis {
                alert_id: i as u64,
                model: None,
            }
            .to_new_task()?
            .with_subject(format!("alert-{i}")),
            1 => Notification {
                channel: "email".into(),
                recipient: if i % 7 == 1 {
                    format!("flaky-{i}@example.com")
                } else {
                    format!("oncall-{i}@example.com")
                },
                message: format!("alert {i} fired"),
            }
            .to_new_task()?
            .with_subject(format!("notify-{i}")),
            _ => RuleDistribution {
                rule_id: i as u64,
                targets: vec!["edge-1".into(), "edge-2".into()],
            }
            .to_new_task()?
            .with_subject(format!("rule-{i}")),
        };
        app.queue.push(task).await?;
    }
    info!(tasks, queue = %queue_name, "demo tasks enqueued");

    let workers = app.spawn_workers(&queue_name);
    let control = app
        .control_loop_every(Arc::new(LogSink), Duration::from_secs(1))
        .spawn();

    tokio::select! {
        _ = tokio::time::sleep(run_for) => info!("demo time elapsed"),
        res = signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received");
        }
    }

    workers.shutdown_and_join().await;
    control.shutdown_and_join().await;

    print_json(&app.monitor.get_queue_metrics(&queue_name).await?)?;
    print_json(&app.monitor.get_health_status().await?)
}

struct DemoAnalyzer;

#[async_trait]
impl Handler<AiAnalysis> for DemoAnalyzer {
    async fn handle(&self, task: AiAnalysis) -> HandlerResult {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let model = task.model.unwrap_or_else(|| "default".to_string());
        Ok(Some(serde_json::json!({
            "alert_id": task.alert_id,
            "model": model,
            "verdict": if task.alert_id % 2 == 0 { "noise" } else { "actionable" },
        })))
    }
}

struct DemoNotifier;

#[async_trait]
impl Handler<Notification> for DemoNotifier {
    async fn handle(&self, task: Notification) -> HandlerResult {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if task.recipient.starts_with("flaky") {
            return Err(HandlerError::Transient(format!(
                "{} gateway timed out",
                task.channel
            )));
        }
        Ok(None)
    }
}

struct DemoDistributor;

#[async_trait]
impl Handler<RuleDistribution> for DemoDistributor {
    async fn handle(&self, task: RuleDistribution) -> HandlerResult {
        if task.targets.is_empty() {
            return Err(HandlerError::Permanent(format!(
                "rule {} has no targets",
                task.rule_id
            )));
        }
        Ok(Some(serde_json::json!({ "delivered": task.targets.len() })))
    }
}
