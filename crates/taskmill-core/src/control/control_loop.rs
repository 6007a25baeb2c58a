//! ControlLoop - periodic recommendations forwarded to a scaling sink.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{AlertCondition, QueueResult};
use crate::monitor::{HealthLevel, QueueMonitor};

use super::{CapacityController, ScalingRecommendation};

/// Shortest tick the loop accepts; a zero period would panic the ticker.
pub const MIN_CONTROL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
#[error("scaling sink failed: {0}")]
pub struct SinkError(pub String);

/// Applies worker targets (a process supervisor, a k8s scaler, ...).
#[async_trait]
pub trait ScalingSink: Send + Sync {
    async fn apply(&self, recommendation: &ScalingRecommendation) -> Result<(), SinkError>;
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ScalingSink for LogSink {
    async fn apply(&self, recommendation: &ScalingRecommendation) -> Result<(), SinkError> {
        info!(
            queue = %recommendation.queue,
            pending = recommendation.pending,
            target_workers = recommendation.target_workers,
            "scaling recommendation"
        );
        Ok(())
    }
}

pub struct ControlLoop {
    controller: CapacityController,
    monitor: QueueMonitor,
    sink: Arc<dyn ScalingSink>,
    interval: Duration,
    auto_pause: bool,
    /// Queues this loop paused itself; only these are resumed automatically.
    auto_paused: HashSet<String>,
}

impl ControlLoop {
    pub fn new(
        controller: CapacityController,
        monitor: QueueMonitor,
        sink: Arc<dyn ScalingSink>,
        interval: Duration,
    ) -> Self {
        Self {
            controller,
            monitor,
            sink,
            interval: interval.max(MIN_CONTROL_INTERVAL),
            auto_pause: false,
            auto_paused: HashSet::new(),
        }
    }

    /// Pause a queue while its error rate is critical, resume once it clears.
    pub fn with_auto_pause(mut self, enabled: bool) -> Self {
        self.auto_pause = enabled;
        self
    }

    /// One control cycle over every known queue.
    pub async fn run_once(&mut self) -> QueueResult<Vec<ScalingRecommendation>> {
        if self.auto_pause {
            self.apply_backpressure().await?;
        }

        let mut recommendations = Vec::new();
        for queue in self.controller.queues().await? {
            let rec = self.controller.recommend(&queue).await?;
            if let Err(e) = self.sink.apply(&rec).await {
                warn!(queue = %rec.queue, error = %e, "scaling sink rejected recommendation");
            }
            recommendations.push(rec);
        }
        Ok(recommendations)
    }

    async fn apply_backpressure(&mut self) -> QueueResult<()> {
        for (queue, health) in self.monitor.get_health_status().await? {
            let critical = health.has_critical(AlertCondition::HighErrorRate);
            if critical && !health.metrics.paused {
                self.controller.pause(&queue).await?;
                warn!(queue = %queue, "queue auto-paused on critical error rate");
                self.auto_paused.insert(queue);
            } else if !critical
                && health.level != HealthLevel::Critical
                && self.auto_paused.contains(&queue)
            {
                self.controller.resume(&queue).await?;
                info!(queue = %queue, "queue auto-resumed");
                self.auto_paused.remove(&queue);
            }
        }
        Ok(())
    }

    /// Run until the handle asks for shutdown.
    pub fn spawn(mut self) -> ControlLoopHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                match self.run_once().await {
                    Ok(recs) => debug!(queues = recs.len(), "control cycle finished"),
                    Err(e) => warn!(error = %e, "control cycle failed"),
                }
            }
        });
        ControlLoopHandle { shutdown_tx, join }
    }
}

pub struct ControlLoopHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ControlLoopHandle {
    pub async fn shutdown_and_join(self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "control loop task ended abnormally");
        }
    }
}
