//! Redis-backed job queue.
//!
//! Layout under one key prefix:
//! - `<p>:jobs`    hash, job id → JSON envelope (also the dedupe index)
//! - `<p>:waiting` list of ready job ids (LPUSH in, RPOPLPUSH out)
//! - `<p>:active`  list of ids currently borrowed by a consumer
//! - `<p>:delayed` sorted set of ids waiting out their backoff, scored by ready time (ms)
//! - `<p>:leases`  sorted set of active ids, scored by lease deadline (ms)
//! - `<p>:dead`    list of dead-letter entries
//!
//! An id sits in exactly one of waiting / active / delayed while its envelope
//! exists, and has a lease exactly while it is active. Ack removes all of it;
//! dead-lettering moves the envelope to the dead list.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::queue::{
    AnalysisJob, BrokerProbe, Delivery, EnqueueError, FailOutcome, JobHandle, JobQueue,
    QueueError, RetryPolicy,
};

const DEFAULT_PREFIX: &str = "cv:analysis";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

const RESERVE_SCRIPT: &str = r#"
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if id then
    redis.call('ZADD', KEYS[3], ARGV[1], id)
end
return id
"#;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
    if redis.call('ZREM', KEYS[1], id) == 1 then
        redis.call('LPUSH', KEYS[2], id)
    end
end
return #due
"#;

const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = 0
for _, id in ipairs(expired) do
    if redis.call('ZREM', KEYS[1], id) == 1 then
        redis.call('LREM', KEYS[2], 0, id)
        local raw = redis.call('HGET', KEYS[3], id)
        if raw then
            local envelope = cjson.decode(raw)
            envelope.attempts_made = envelope.attempts_made + 1
            envelope.last_error = ARGV[2]
            redis.call('HSET', KEYS[3], id, cjson.encode(envelope))
            redis.call('LPUSH', KEYS[4], id)
            moved = moved + 1
        end
    end
end
return moved
"#;

const LEASE_EXPIRED: &str = "lease expired before the attempt reported back";

/// Stored form of a job, with its delivery history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct JobEnvelope {
    job: AnalysisJob,
    attempts_made: u32,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeadLetter {
    job: AnalysisJob,
    attempts: u32,
    reason: String,
    failed_at: DateTime<Utc>,
}

struct QueueKeys {
    jobs: String,
    waiting: String,
    active: String,
    delayed: String,
    leases: String,
    dead: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            jobs: format!("{prefix}:jobs"),
            waiting: format!("{prefix}:waiting"),
            active: format!("{prefix}:active"),
            delayed: format!("{prefix}:delayed"),
            leases: format!("{prefix}:leases"),
            dead: format!("{prefix}:dead"),
        }
    }
}

pub struct RedisJobQueue {
    client: Client,
    keys: QueueKeys,
    policy: RetryPolicy,
    lease: Duration,
    connection: Mutex<Option<MultiplexedConnection>>,
    enqueue_script: Script,
    reserve_script: Script,
    promote_script: Script,
    reclaim_script: Script,
}

impl RedisJobQueue {
    /// `lease` bounds how long one attempt may hold a job before it is redelivered.
    pub fn new(client: Client, policy: RetryPolicy, lease: Duration) -> Self {
        Self::with_prefix(client, policy, lease, DEFAULT_PREFIX)
    }

    pub fn with_prefix(client: Client, policy: RetryPolicy, lease: Duration, prefix: &str) -> Self {
        Self {
            client,
            keys: QueueKeys::new(prefix),
            policy,
            lease,
            connection: Mutex::new(None),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
        }
    }

    /// Returns the shared connection, opening it on first use or after a drop.
    async fn connection(&self) -> Result<MultiplexedConnection, RedisError> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = bounded(self.client.get_multiplexed_async_connection()).await?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the cached connection when an error means it is no longer usable.
    async fn forget_if_broken(&self, err: &RedisError) {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            *self.connection.lock().await = None;
        }
    }

    async fn checked<T>(&self, result: Result<T, RedisError>) -> Result<T, QueueError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.forget_if_broken(&e).await;
                Err(QueueError::Broker(e.to_string()))
            }
        }
    }

    async fn connect(&self) -> Result<MultiplexedConnection, QueueError> {
        let result = self.connection().await;
        self.checked(result).await
    }

    async fn load_envelope(
        &self,
        conn: &mut MultiplexedConnection,
        job_id: &str,
    ) -> Result<Option<JobEnvelope>, QueueError> {
        let raw: Option<String> = {
            let result = bounded(
                redis::cmd("HGET")
                    .arg(&self.keys.jobs)
                    .arg(job_id)
                    .query_async(conn),
            )
            .await;
            self.checked(result).await?
        };
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| QueueError::Corrupt {
                job_id: job_id.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &AnalysisJob) -> Result<JobHandle, EnqueueError> {
        job.validate()?;
        let job_id = job.dedupe_key();
        let payload = serde_json::to_string(&JobEnvelope {
            job: job.clone(),
            attempts_made: 0,
            last_error: None,
        })
        .map_err(|e| EnqueueError::Malformed(e.to_string()))?;

        let mut conn = self
            .connect()
            .await
            .map_err(|e| EnqueueError::BrokerUnavailable(e.to_string()))?;
        let result = bounded(
            self.enqueue_script
                .key(&self.keys.jobs)
                .key(&self.keys.waiting)
                .arg(&job_id)
                .arg(&payload)
                .invoke_async::<_, i64>(&mut conn),
        )
        .await;
        let inserted = self
            .checked(result)
            .await
            .map_err(|e| EnqueueError::BrokerUnavailable(e.to_string()))?;

        let duplicate = inserted == 0;
        if duplicate {
            debug!("Job {job_id} is already queued; keeping the existing entry");
        } else {
            debug!("Enqueued analysis job {job_id}");
        }
        Ok(JobHandle { job_id, duplicate })
    }

    async fn reserve(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connect().await?;

        let now_ms = Utc::now().timestamp_millis();
        let result = bounded(
            self.promote_script
                .key(&self.keys.delayed)
                .key(&self.keys.waiting)
                .arg(now_ms)
                .invoke_async::<_, i64>(&mut conn),
        )
        .await;
        let promoted = self.checked(result).await?;
        if promoted > 0 {
            debug!("Promoted {promoted} delayed job(s) to waiting");
        }

        let deadline_ms = now_ms + millis(self.lease);
        let result = bounded(
            self.reserve_script
                .key(&self.keys.waiting)
                .key(&self.keys.active)
                .key(&self.keys.leases)
                .arg(deadline_ms)
                .invoke_async::<_, Option<String>>(&mut conn),
        )
        .await;
        let Some(job_id) = self.checked(result).await? else {
            return Ok(None);
        };

        match self.load_envelope(&mut conn, &job_id).await {
            Ok(Some(envelope)) => Ok(Some(Delivery {
                job: envelope.job,
                attempt: envelope.attempts_made + 1,
            })),
            Ok(None) => {
                warn!("Job {job_id} has no payload; dropping it from the active lane");
                let result = bounded(
                    redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(&self.keys.active)
                        .arg(0)
                        .arg(&job_id)
                        .ignore()
                        .cmd("ZREM")
                        .arg(&self.keys.leases)
                        .arg(&job_id)
                        .ignore()
                        .query_async::<_, ()>(&mut conn),
                )
                .await;
                self.checked(result).await?;
                Ok(None)
            }
            Err(e) => {
                warn!("Job {job_id} payload is unreadable; dead-lettering it: {e}");
                let result = bounded(
                    redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(&self.keys.active)
                        .arg(0)
                        .arg(&job_id)
                        .ignore()
                        .cmd("ZREM")
                        .arg(&self.keys.leases)
                        .arg(&job_id)
                        .ignore()
                        .cmd("HDEL")
                        .arg(&self.keys.jobs)
                        .arg(&job_id)
                        .ignore()
                        .cmd("LPUSH")
                        .arg(&self.keys.dead)
                        .arg(format!("{{\"job_id\":\"{job_id}\",\"reason\":\"corrupt payload\"}}"))
                        .ignore()
                        .query_async::<_, ()>(&mut conn),
                )
                .await;
                self.checked(result).await?;
                Err(e)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let job_id = delivery.job_id();
        let mut conn = self.connect().await?;
        let result = bounded(
            redis::pipe()
                .atomic()
                .cmd("LREM")
                .arg(&self.keys.active)
                .arg(0)
                .arg(&job_id)
                .ignore()
                .cmd("ZREM")
                .arg(&self.keys.leases)
                .arg(&job_id)
                .ignore()
                .cmd("HDEL")
                .arg(&self.keys.jobs)
                .arg(&job_id)
                .ignore()
                .query_async::<_, ()>(&mut conn),
        )
        .await;
        self.checked(result).await?;
        debug!("Acknowledged job {job_id}");
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailOutcome, QueueError> {
        let job_id = delivery.job_id();
        let outcome = self.policy.on_failure(delivery.attempt);
        let mut conn = self.connect().await?;

        let result = match outcome {
            FailOutcome::Retrying { delay, .. } => {
                let envelope = JobEnvelope {
                    job: delivery.job.clone(),
                    attempts_made: delivery.attempt,
                    last_error: Some(reason.to_string()),
                };
                let payload = serde_json::to_string(&envelope).map_err(|e| QueueError::Corrupt {
                    job_id: job_id.clone(),
                    reason: e.to_string(),
                })?;
                let ready_at = Utc::now().timestamp_millis() + millis(delay);

                bounded(
                    redis::pipe()
                        .atomic()
                        .cmd("HSET")
                        .arg(&self.keys.jobs)
                        .arg(&job_id)
                        .arg(&payload)
                        .ignore()
                        .cmd("LREM")
                        .arg(&self.keys.active)
                        .arg(0)
                        .arg(&job_id)
                        .ignore()
                        .cmd("ZREM")
                        .arg(&self.keys.leases)
                        .arg(&job_id)
                        .ignore()
                        .cmd("ZADD")
                        .arg(&self.keys.delayed)
                        .arg(ready_at)
                        .arg(&job_id)
                        .ignore()
                        .query_async::<_, ()>(&mut conn),
                )
                .await
            }
            FailOutcome::DeadLettered { attempts } => {
                let entry = serde_json::to_string(&DeadLetter {
                    job: delivery.job.clone(),
                    attempts,
                    reason: reason.to_string(),
                    failed_at: Utc::now(),
                })
                .map_err(|e| QueueError::Corrupt {
                    job_id: job_id.clone(),
                    reason: e.to_string(),
                })?;

                bounded(
                    redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(&self.keys.active)
                        .arg(0)
                        .arg(&job_id)
                        .ignore()
                        .cmd("ZREM")
                        .arg(&self.keys.leases)
                        .arg(&job_id)
                        .ignore()
                        .cmd("HDEL")
                        .arg(&self.keys.jobs)
                        .arg(&job_id)
                        .ignore()
                        .cmd("LPUSH")
                        .arg(&self.keys.dead)
                        .arg(&entry)
                        .ignore()
                        .query_async::<_, ()>(&mut conn),
                )
                .await
            }
        };
        self.checked(result).await?;
        Ok(outcome)
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.connect().await?;
        let result = bounded(
            self.reclaim_script
                .key(&self.keys.leases)
                .key(&self.keys.active)
                .key(&self.keys.jobs)
                .key(&self.keys.waiting)
                .arg(Utc::now().timestamp_millis())
                .arg(LEASE_EXPIRED)
                .invoke_async::<_, i64>(&mut conn),
        )
        .await;
        let moved = self.checked(result).await?;
        if moved > 0 {
            info!("Requeued {moved} analysis job(s) with expired leases");
        }
        Ok(usize::try_from(moved).unwrap_or(0))
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl BrokerProbe for RedisJobQueue {
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connect().await?;
        let result = bounded(redis::cmd("PING").query_async::<_, String>(&mut conn)).await;
        self.checked(result).await.map(|_| ())
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 2)
}

/// Puts an upper bound on a single broker round trip.
async fn bounded<T, F>(fut: F) -> Result<T, RedisError>
where
    F: std::future::Future<Output = Result<T, RedisError>>,
{
    match tokio::time::timeout(COMMAND_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(RedisError::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "redis command timed out",
        ))),
    }
}
