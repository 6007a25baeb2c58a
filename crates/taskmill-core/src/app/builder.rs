//! AppBuilder: wires store, engine, monitor, controller and handlers.
//!
//! `build()` fails fast when a task type passed to `expect_tasks()` has no
//! registered handler.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{StoreBackend, StoreConfig, TaskmillConfig};
use crate::control::{CapacityController, ControlLoop, ScalingSink};
use crate::domain::StoreError;
use crate::impls::{InMemoryStore, RedisStore};
use crate::monitor::QueueMonitor;
use crate::ports::{Clock, QueueStore, SystemClock};
use crate::queue::TaskQueue;
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

use super::worker::WorkerGroup;

/// ```ignore
/// let app = AppBuilder::new(config)
///     .with_store(store)
///     .register::<Notification, _>(Mailer)?
///     .expect_tasks(&[Notification::TYPE])
///     .build()?;
/// ```
pub struct AppBuilder {
    config: TaskmillConfig,
    store: Option<Arc<dyn QueueStore>>,
    clock: Arc<dyn Clock>,
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),
}

impl AppBuilder {
    pub fn new(config: TaskmillConfig) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            registry: TypedRegistry::new(),
            expected_tasks: None,
        }
    }

    /// Defaults to an in-memory store when not set.
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected) = &self.expected_tasks {
            let registered = self.registry.registered_types();
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !registered.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            Arc::clone(&self.clock),
            self.config.engine_config(),
        )
        .with_retry_policy(self.config.retry_policy());
        let monitor = QueueMonitor::new(store, self.clock, self.config.monitor_config());
        let controller = CapacityController::new(
            queue.clone(),
            monitor.clone(),
            self.config.scaling.tiers.clone(),
        );

        Ok(App {
            queue,
            monitor,
            controller,
            registry: Arc::new(self.registry),
            config: self.config,
        })
    }
}

/// Open the store named by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn QueueStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.url, &config.key_prefix).await?;
            info!(prefix = %config.key_prefix, "connected to redis");
            Ok(Arc::new(store))
        }
    }
}

/// A wired application. Cheap to clone pieces out of.
pub struct App {
    pub queue: TaskQueue,
    pub monitor: QueueMonitor,
    pub controller: CapacityController,
    pub registry: Arc<TypedRegistry>,
    pub config: TaskmillConfig,
}

impl App {
    /// Workers for `queue_name`, sized and paced by the `[worker]` section.
    pub fn spawn_workers(&self, queue_name: &str) -> WorkerGroup {
        self.spawn_worker_count(queue_name, self.config.worker.concurrency)
    }

    pub fn spawn_worker_count(&self, queue_name: &str, n: usize) -> WorkerGroup {
        WorkerGroup::spawn(
            n,
            queue_name,
            self.queue.clone(),
            Arc::clone(&self.registry),
            self.config.poll_interval(),
        )
    }

    pub fn control_loop(&self, sink: Arc<dyn ScalingSink>) -> ControlLoop {
        self.control_loop_every(sink, self.config.control_interval())
    }

    pub fn control_loop_every(&self, sink: Arc<dyn ScalingSink>, interval: Duration) -> ControlLoop {
        ControlLoop::new(
            self.controller.clone(),
            self.monitor.clone(),
            sink,
            interval,
        )
        .with_auto_pause(self.config.scaling.auto_pause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;
    use crate::typed::handler::fixtures::{EchoAnalysis, PickyNotifier};
    use crate::typed::{AiAnalysis, Notification};

    #[test]
    fn build_with_all_expected_tasks() {
        let app = AppBuilder::new(TaskmillConfig::default())
            .register::<AiAnalysis, _>(EchoAnalysis)
            .unwrap()
            .expect_tasks(&[AiAnalysis::TYPE])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn build_reports_missing_task_types() {
        let app = AppBuilder::new(TaskmillConfig::default())
            .register::<AiAnalysis, _>(EchoAnalysis)
            .unwrap()
            .expect_tasks(&[AiAnalysis::TYPE, Notification::TYPE])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![Notification::TYPE.to_string()]
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let result = AppBuilder::new(TaskmillConfig::default())
            .register::<Notification, _>(PickyNotifier)
            .unwrap()
            .register::<Notification, _>(PickyNotifier);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn built_app_shares_one_store() {
        let mut config = TaskmillConfig::default();
        config.engine.default_queue = "alerts".into();
        let app = AppBuilder::new(config).build().unwrap();

        let record = app
            .queue
            .push(crate::domain::NewTask::new("notification", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(record.queue, "alerts");
        assert_eq!(record.status, TaskStatus::Pending);

        let metrics = app.monitor.get_queue_metrics("alerts").await.unwrap();
        assert_eq!(metrics.pending, 1);
        assert_eq!(app.controller.queues().await.unwrap(), vec!["alerts".to_string()]);
    }

    #[tokio::test]
    async fn memory_backend_opens_without_network() {
        let store = open_store(&StoreConfig::default()).await.unwrap();
        assert!(store.queues().await.unwrap().is_empty());
    }
}
