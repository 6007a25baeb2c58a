use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::queue::{Lease, TaskQueue};
use crate::typed::TypedRegistry;

/// Worker group handle.
/// - dropping or signalling `shutdown_tx` stops every worker
/// - `shutdown_and_join()` waits for them to finish
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers leasing from `queue_name`.
    pub fn spawn(
        n: usize,
        queue_name: &str,
        queue: TaskQueue,
        registry: Arc<TypedRegistry>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for i in 0..n {
            let worker = Worker {
                worker_id: format!("{queue_name}-worker-{i}"),
                queue_name: queue_name.to_string(),
                queue: queue.clone(),
                registry: Arc::clone(&registry),
                poll_interval,
            };
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker.run(&mut rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new leases. In-flight handlers run to completion.
    pub fn request_shutdown(&self) {
        // receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

struct Worker {
    worker_id: String,
    queue_name: String,
    queue: TaskQueue,
    registry: Arc<TypedRegistry>,
    poll_interval: Duration,
}

impl Worker {
    async fn run(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let lease = match self.queue.lease(&self.queue_name, &self.worker_id).await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "lease failed");
                    None
                }
            };

            let Some(lease) = lease else {
                // idle: wait for work or shutdown
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };

            self.process(lease).await;
        }
        debug!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn process(&self, lease: Lease) {
        let task_type = lease.record.task_type.as_str();
        let Some(handler) = self.registry.get(task_type) else {
            let error = format!("no handler registered for task type '{task_type}'");
            if let Err(e) = self.queue.nack(&lease, false, &error).await {
                warn!(worker_id = %self.worker_id, task_id = %lease.task_id, error = %e, "nack failed");
            }
            return;
        };

        let outcome = handler.handle_dyn(lease.record.payload.clone()).await;
        let report = match outcome {
            Ok(result) => self.queue.ack(&lease, result).await,
            Err(err) => {
                warn!(
                    worker_id = %self.worker_id,
                    task_id = %lease.task_id,
                    retryable = err.is_retryable(),
                    error = %err,
                    "handler failed"
                );
                self.queue
                    .nack(&lease, err.is_retryable(), &err.to_string())
                    .await
            }
        };
        // Conflict here means an operator cancelled or the lease was reclaimed.
        if let Err(e) = report {
            warn!(worker_id = %self.worker_id, task_id = %lease.task_id, error = %e, "result not recorded");
        }
    }
}
