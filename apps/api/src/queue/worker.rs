//! Worker pool: a fixed number of consumers running the processing routine
//! for queued jobs, plus a reaper that hands expired leases back to the queue.
//! Each consumer handles one job at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pipeline::routine::ProcessingRoutine;
use crate::queue::{Delivery, FailOutcome, JobQueue, QueueError};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    /// Pause between polls when the queue is empty or unreachable.
    pub poll_interval: Duration,
    /// How often expired leases are reclaimed.
    pub reap_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(500),
            reap_interval: Duration::from_secs(15),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Acked,
    Retrying { next_attempt: u32, delay: Duration },
    DeadLettered,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    routine: Arc<ProcessingRoutine>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        routine: Arc<ProcessingRoutine>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            routine,
            config,
        }
    }

    /// Spawns the reaper and the consumers. Consumers exit after their current
    /// job once `shutdown` flips to true.
    pub async fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let concurrency = self.config.concurrency.max(1);
        info!("Starting {concurrency} analysis worker(s)");

        let reaper = {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.reap(shutdown).await })
        };
        let mut handles = vec![reaper];
        handles.extend((0..concurrency).map(|n| {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.consume(n, shutdown).await })
        }));
        handles
    }

    /// Reclaims expired leases every `reap_interval`, starting immediately so
    /// jobs orphaned by a previous process are picked up on boot.
    async fn reap(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.reclaim_expired().await {
                        warn!("Could not reclaim expired jobs: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Lease reaper stopped");
    }

    async fn consume(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.queue.reserve().await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle(&delivery).await {
                        error!(
                            "Worker {worker} could not settle job {}: {e}",
                            delivery.job_id()
                        );
                    }
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!("Worker {worker} could not reserve a job: {e}");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!("Worker {worker} stopped");
    }

    /// Runs the routine for one delivery and settles it with the queue.
    pub async fn handle(&self, delivery: &Delivery) -> Result<DeliveryOutcome, QueueError> {
        let id = delivery.job.analysis_id;
        if self.queue.retry_policy().exhausted(delivery.attempt) {
            let reason = format!(
                "Processing did not finish within {} attempts",
                delivery.attempt - 1
            );
            self.queue.fail(delivery, &reason).await?;
            return Ok(self.bury(delivery, delivery.attempt - 1, &reason).await);
        }
        debug!("Processing analysis {id} (attempt {})", delivery.attempt);

        let err = match self.routine.run(&delivery.job).await {
            Ok(outcome) => {
                debug!("Analysis {id} settled: {outcome:?}");
                self.queue.ack(delivery).await?;
                return Ok(DeliveryOutcome::Acked);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            // Terminal errors are already on the record; retrying cannot help.
            self.queue.ack(delivery).await?;
            return Ok(DeliveryOutcome::Acked);
        }

        let reason = err.to_string();
        match self.queue.fail(delivery, &reason).await? {
            FailOutcome::Retrying {
                next_attempt,
                delay,
            } => {
                info!(
                    "Analysis {id} will be retried (attempt {next_attempt}) in {}ms",
                    delay.as_millis()
                );
                Ok(DeliveryOutcome::Retrying {
                    next_attempt,
                    delay,
                })
            }
            FailOutcome::DeadLettered { attempts } => {
                Ok(self.bury(delivery, attempts, &reason).await)
            }
        }
    }

    /// Fails the record of a job the queue has given up on.
    async fn bury(&self, delivery: &Delivery, attempts: u32, reason: &str) -> DeliveryOutcome {
        let id = delivery.job.analysis_id;
        error!("Analysis {id} dead-lettered after {attempts} attempt(s): {reason}");
        if let Err(e) = self.routine.abandon(&delivery.job, reason).await {
            error!("Could not mark dead-lettered analysis {id} failed: {e}");
        }
        DeliveryOutcome::DeadLettered
    }
}
