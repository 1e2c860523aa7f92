use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::DeliveryQueue;
use crate::utils::Error;

const FALLBACK_CHECK_INTERVAL: Duration = Duration::from_millis(1000);
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Background task that drains a `DeliveryQueue`.
///
/// Every `queue_check_interval` it runs a processing pass, and every
/// `cleanup_interval` an expiry sweep when `auto_cleanup_expired` is set.
/// Both run on tokio's blocking pool since they take the queue lock and call
/// the sink synchronously.
pub struct DeliveryWorker;

impl DeliveryWorker {
    pub fn spawn(queue: Arc<DeliveryQueue>) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            info!("Message processing task started");
            let mut last_cleanup = Instant::now();

            loop {
                let queue = Arc::clone(&queue);
                let tick = tokio::task::spawn_blocking(move || {
                    let mut last_cleanup = last_cleanup;
                    let interval = run_tick(&queue, &mut last_cleanup);
                    (interval, last_cleanup)
                })
                .await;

                let interval = match tick {
                    Ok((interval, cleaned_at)) => {
                        last_cleanup = cleaned_at;
                        interval
                    }
                    Err(e) => {
                        error!("Processing pass aborted, retrying: {}", e);
                        FALLBACK_CHECK_INTERVAL
                    }
                };

                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(interval.max(MIN_CHECK_INTERVAL)) => {}
                }
            }

            info!("Message processing task stopped");
        });

        WorkerHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// One worker iteration. Returns how long to sleep before the next one.
fn run_tick(queue: &DeliveryQueue, last_cleanup: &mut Instant) -> Duration {
    let config = match queue.config() {
        Ok(config) => config,
        Err(e) => {
            warn!("Skipping processing pass: {}", e);
            return FALLBACK_CHECK_INTERVAL;
        }
    };

    match queue.process_once() {
        Ok(report) if !report.is_empty() => debug!("Processed {:?}", report),
        Ok(_) => {}
        Err(Error::InvalidState(reason)) => debug!("Queue not processed: {}", reason),
        Err(e) => warn!("Processing pass failed: {}", e),
    }

    if last_cleanup.elapsed() >= config.cleanup_interval {
        if config.auto_cleanup_expired {
            if let Err(e) = queue.cleanup_expired() {
                warn!("Expired message cleanup failed: {}", e);
            }
        }
        *last_cleanup = Instant::now();
    }

    config.queue_check_interval
}

/// Handle to a running `DeliveryWorker`.
///
/// Dropping the handle also stops the worker, at its next wake-up.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stops the worker and waits for its current pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!("Delivery worker ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
