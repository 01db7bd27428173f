//! Durable analysis job queue.
//!
//! At-least-once delivery: a reserved job is leased to one consumer until it is
//! acknowledged, retried with backoff, or moved to the dead lane once the
//! retry budget is spent. A lease that runs out before the consumer reports
//! back is reclaimed and the job redelivered; the lost attempt counts against
//! the budget. The queue knows nothing about analysis records; the consumer
//! reconciles a dead-lettered job's record itself.
//!
//! - `redis_queue`: production backend on Redis
//! - `monitor`: broker availability signal used by the dispatcher
//! - `worker`: bounded pool of consumers

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod monitor;
pub mod redis_queue;
pub mod worker;

pub use self::monitor::BrokerMonitor;
pub use self::redis_queue::RedisJobQueue;
pub use self::worker::{WorkerPool, WorkerPoolConfig};

/// One unit of work, correlated 1:1 with an analysis record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub analysis_id: Uuid,
    pub user_id: Uuid,
    pub file_path: PathBuf,
    pub original_file_name: String,
}

impl AnalysisJob {
    /// The record id doubles as the deduplication key.
    pub fn dedupe_key(&self) -> String {
        self.analysis_id.to_string()
    }

    pub fn validate(&self) -> Result<(), EnqueueError> {
        if self.file_path.as_os_str().is_empty() {
            return Err(EnqueueError::Malformed("job has no artifact path".to_string()));
        }
        if self.original_file_name.trim().is_empty() {
            return Err(EnqueueError::Malformed(
                "job has no original file name".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job_id: String,
    /// True when a job with the same key was already queued.
    pub duplicate: bool,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("message broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("malformed job payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message broker error: {0}")]
    Broker(String),

    #[error("corrupt payload for job {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },
}

/// A job borrowed by one consumer for one processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job: AnalysisJob,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn job_id(&self) -> String {
        self.job.dedupe_key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailOutcome {
    Retrying { next_attempt: u32, delay: Duration },
    DeadLettered { attempts: u32 },
}

/// Fixed retry budget with exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// True once a delivery is past the budget, which only happens when
    /// earlier attempts were lost to expired leases.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Delay before the attempt that follows failed attempt `attempt` (1-based):
    /// base, 2×base, 4×base, …
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }

    pub fn on_failure(&self, attempt: u32) -> FailOutcome {
        if attempt >= self.max_attempts {
            FailOutcome::DeadLettered { attempts: attempt }
        } else {
            FailOutcome::Retrying {
                next_attempt: attempt + 1,
                delay: self.backoff(attempt),
            }
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submits a job keyed by its record id. Submitting a key that is still
    /// queued returns the existing handle instead of a second job.
    async fn enqueue(&self, job: &AnalysisJob) -> Result<JobHandle, EnqueueError>;

    /// Takes the next ready job, if any, and leases it for one processing attempt.
    async fn reserve(&self) -> Result<Option<Delivery>, QueueError>;

    /// Marks a delivery as done so it is never redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Records a failed attempt: schedules a retry or dead-letters the job.
    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailOutcome, QueueError>;

    /// Returns jobs whose lease ran out to the ready lane, charging the lost
    /// attempt. Jobs still within their lease are left alone.
    async fn reclaim_expired(&self) -> Result<usize, QueueError>;

    fn retry_policy(&self) -> RetryPolicy;
}

/// Liveness check of the message broker.
#[async_trait]
pub trait BrokerProbe: Send + Sync {
    async fn ping(&self) -> Result<(), QueueError>;
}
