//! Dispatcher: entry point for a new upload.
//!
//! Validates the upload and the owner's quota, stores the artifact, creates
//! the record, then hands a job to the first strategy that accepts it. With
//! the broker reported up the plan is queued-then-inline; otherwise inline
//! only. If every strategy fails the record is marked failed before the
//! error is returned, so no record is left in `processing` by dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::analysis::{AnalysisRow, NewAnalysis};
use crate::pipeline::error::PipelineError;
use crate::pipeline::quota::QuotaTracker;
use crate::pipeline::routine::ProcessingRoutine;
use crate::queue::monitor::BrokerMonitor;
use crate::queue::{AnalysisJob, JobQueue};
use crate::storage::{remove_local, ArtifactStore};
use crate::store::AnalysisStore;

#[derive(Debug, Clone)]
pub struct Upload {
    pub user_id: Uuid,
    pub original_file_name: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Queued; the record is still `processing`.
    Accepted { analysis_id: Uuid, job_id: String },
    /// Processed inline; the record is terminal.
    Finished(AnalysisRow),
}

/// One way of getting a job processed.
#[async_trait]
pub trait DispatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, job: &AnalysisJob) -> Result<DispatchOutcome, PipelineError>;
}

/// Hands the job to the durable queue.
pub struct AsyncStrategy {
    queue: Arc<dyn JobQueue>,
}

impl AsyncStrategy {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl DispatchStrategy for AsyncStrategy {
    fn name(&self) -> &'static str {
        "queued"
    }

    async fn dispatch(&self, job: &AnalysisJob) -> Result<DispatchOutcome, PipelineError> {
        let handle = self
            .queue
            .enqueue(job)
            .await
            .map_err(PipelineError::infra)?;
        Ok(DispatchOutcome::Accepted {
            analysis_id: job.analysis_id,
            job_id: handle.job_id,
        })
    }
}

/// Runs the routine in the caller's task and returns the terminal record.
pub struct SyncStrategy {
    routine: Arc<ProcessingRoutine>,
    records: Arc<dyn AnalysisStore>,
}

impl SyncStrategy {
    pub fn new(routine: Arc<ProcessingRoutine>, records: Arc<dyn AnalysisStore>) -> Self {
        Self { routine, records }
    }
}

#[async_trait]
impl DispatchStrategy for SyncStrategy {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn dispatch(&self, job: &AnalysisJob) -> Result<DispatchOutcome, PipelineError> {
        match self.routine.run(job).await {
            Ok(_) => {}
            // Nothing retries an inline attempt, so a retryable failure is final here.
            Err(e) if e.is_retryable() => {
                self.routine.abandon(job, &e.to_string()).await?;
            }
            Err(PipelineError::RecordMissing(id)) => return Err(PipelineError::RecordMissing(id)),
            // Terminal failures were already written onto the record.
            Err(_) => {}
        }

        let record = self
            .records
            .get(job.analysis_id)
            .await
            .map_err(PipelineError::infra)?
            .ok_or(PipelineError::RecordMissing(job.analysis_id))?;
        Ok(DispatchOutcome::Finished(record))
    }
}

pub struct Dispatcher {
    quota: QuotaTracker,
    records: Arc<dyn AnalysisStore>,
    artifacts: ArtifactStore,
    monitor: Arc<BrokerMonitor>,
    routine: Arc<ProcessingRoutine>,
    queued: Arc<dyn DispatchStrategy>,
    inline: Arc<dyn DispatchStrategy>,
}

impl Dispatcher {
    pub fn new(
        quota: QuotaTracker,
        records: Arc<dyn AnalysisStore>,
        artifacts: ArtifactStore,
        monitor: Arc<BrokerMonitor>,
        routine: Arc<ProcessingRoutine>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            queued: Arc::new(AsyncStrategy::new(queue)),
            inline: Arc::new(SyncStrategy::new(routine.clone(), records.clone())),
            quota,
            records,
            artifacts,
            monitor,
            routine,
        }
    }

    /// Strategies to try, in order, given the current broker reading.
    fn plan(&self) -> Vec<Arc<dyn DispatchStrategy>> {
        if self.monitor.is_available() {
            vec![self.queued.clone(), self.inline.clone()]
        } else {
            vec![self.inline.clone()]
        }
    }

    pub async fn dispatch(&self, upload: Upload) -> Result<DispatchOutcome, PipelineError> {
        self.artifacts
            .validate_upload(&upload.original_file_name, upload.bytes.len())
            .map_err(|e| PipelineError::Validation(e.to_string()))?;

        if !self.quota.can_analyze(upload.user_id).await? {
            info!("User {} is over the monthly analysis limit", upload.user_id);
            return Err(PipelineError::QuotaExceeded);
        }

        let path = self
            .artifacts
            .save_upload(upload.user_id, &upload.original_file_name, &upload.bytes)
            .await
            .map_err(PipelineError::infra)?;

        let record = match self
            .records
            .create(NewAnalysis {
                id: Uuid::new_v4(),
                user_id: upload.user_id,
                original_file_name: upload.original_file_name.clone(),
                file_url: path.to_string_lossy().into_owned(),
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                if let Err(io) = remove_local(&path).await {
                    warn!("Could not remove orphaned upload {}: {io}", path.display());
                }
                return Err(PipelineError::infra(e));
            }
        };

        let job = AnalysisJob {
            analysis_id: record.id,
            user_id: upload.user_id,
            file_path: path,
            original_file_name: upload.original_file_name,
        };

        let mut last_error = None;
        for strategy in self.plan() {
            match strategy.dispatch(&job).await {
                Ok(outcome) => {
                    info!("Analysis {} dispatched {}", record.id, strategy.name());
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(
                        "Dispatching analysis {} {} failed: {e}",
                        record.id,
                        strategy.name()
                    );
                    last_error = Some(e);
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| PipelineError::TransientInfra("no dispatch strategy".to_string()));
        if let Err(e) = self.routine.abandon(&job, &err.to_string()).await {
            warn!("Could not mark analysis {} failed: {e}", record.id);
        }
        Err(err)
    }
}
