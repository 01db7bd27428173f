//! Processing Routine.
//!
//! Runs one attempt at analysing one record. Both dispatch paths call it, and
//! the queue may call it again for the same record, so every side effect is
//! gated on the record still being `processing`:
//!
//! 1. load the record (absent → stale job, non-retryable)
//! 2. stop if it is already terminal
//! 3. extract text; under `MIN_TEXT_CHARS` is a terminal content error
//! 4. analyze (service errors are retryable)
//! 5. complete the record (compare-and-set)
//! 6. charge quota, only if step 5 applied
//! 7. migrate the artifact to remote storage, best-effort
//!
//! The local file is held by a [`LocalArtifact`] guard. It is deleted when the
//! record ends up failed or gone and when it has been migrated; it is kept
//! while a retry is still possible and when it is the record's only copy.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::analyzer::CvAnalyzer;
use crate::analysis::extractor::{ExtractError, TextExtractor};
use crate::config::PipelineTimeouts;
use crate::models::analysis::{AnalysisResult, AnalysisStatus};
use crate::pipeline::error::PipelineError;
use crate::pipeline::quota::QuotaTracker;
use crate::queue::AnalysisJob;
use crate::storage::{remove_local, ArtifactLocation, ArtifactStore, LocalArtifact};
use crate::store::AnalysisStore;

/// Shortest extracted text worth sending to the analyzer.
pub const MIN_TEXT_CHARS: usize = 100;

pub const INSUFFICIENT_TEXT_MESSAGE: &str =
    "Not enough text could be extracted from the document. Upload a text-based PDF, not a scan.";

#[derive(Debug, Clone, PartialEq)]
pub enum RoutineOutcome {
    /// This attempt completed the record.
    Completed {
        score: i32,
        location: ArtifactLocation,
    },
    /// The record was already terminal; nothing was done.
    AlreadyFinished(AnalysisStatus),
    /// The record disappeared while the attempt was running; results were dropped.
    Discarded,
}

#[derive(Clone)]
pub struct ProcessingRoutine {
    records: Arc<dyn AnalysisStore>,
    quota: QuotaTracker,
    extractor: Arc<dyn TextExtractor>,
    analyzer: Arc<dyn CvAnalyzer>,
    artifacts: ArtifactStore,
    timeouts: PipelineTimeouts,
}

impl ProcessingRoutine {
    pub fn new(
        records: Arc<dyn AnalysisStore>,
        quota: QuotaTracker,
        extractor: Arc<dyn TextExtractor>,
        analyzer: Arc<dyn CvAnalyzer>,
        artifacts: ArtifactStore,
        timeouts: PipelineTimeouts,
    ) -> Self {
        Self {
            records,
            quota,
            extractor,
            analyzer,
            artifacts,
            timeouts,
        }
    }

    pub async fn run(&self, job: &AnalysisJob) -> Result<RoutineOutcome, PipelineError> {
        let started = Instant::now();
        let id = job.analysis_id;

        let record = match self.records.get(id).await.map_err(PipelineError::infra)? {
            Some(record) => record,
            None => {
                warn!("Analysis {id} no longer exists; dropping its artifact");
                release_path(&job.file_path).await;
                return Err(PipelineError::RecordMissing(id));
            }
        };

        if record.status.is_terminal() {
            info!(
                "Analysis {id} is already {}; skipping redelivered job",
                record.status
            );
            return Ok(RoutineOutcome::AlreadyFinished(record.status));
        }

        let artifact = LocalArtifact::new(&job.file_path);

        let result = match self.analyze_artifact(artifact.path()).await {
            Ok(result) => result,
            Err(e) => return Err(self.settle_failure(id, artifact, e).await),
        };

        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let applied = match self.records.complete(id, &result, elapsed_ms).await {
            Ok(applied) => applied,
            Err(e) => {
                return Err(self
                    .settle_failure(id, artifact, PipelineError::infra(e))
                    .await)
            }
        };
        if !applied {
            return Ok(self.discard(id, artifact).await);
        }
        info!(
            "Analysis {id} completed with score {} in {elapsed_ms}ms",
            result.score
        );

        // Quota is charged once per applied completion and never fails the job.
        if let Err(e) = self.quota.charge(job.user_id).await {
            error!("Could not charge quota for user {}: {e}", job.user_id);
        }

        match self.migrate(job, artifact).await {
            Some(location) => Ok(RoutineOutcome::Completed {
                score: result.score,
                location,
            }),
            None => Ok(RoutineOutcome::Discarded),
        }
    }

    /// Marks a record failed on behalf of a path that will not call `run` again,
    /// and removes its local artifact. Returns whether the record was marked.
    pub async fn abandon(&self, job: &AnalysisJob, reason: &str) -> Result<bool, PipelineError> {
        let id = job.analysis_id;
        let marked = self
            .records
            .fail(id, reason)
            .await
            .map_err(PipelineError::infra)?;

        let release = if marked {
            warn!("Analysis {id} marked failed: {reason}");
            true
        } else {
            // Already terminal or deleted. Only a missing record frees the file here;
            // a completed one may still point at it.
            match self.records.get(id).await {
                Ok(Some(record)) => record.status == AnalysisStatus::Failed,
                Ok(None) => true,
                Err(e) => {
                    warn!("Could not reload analysis {id} after abandoning it: {e}");
                    false
                }
            }
        };
        if release {
            release_path(&job.file_path).await;
        }
        Ok(marked)
    }

    async fn analyze_artifact(&self, path: &Path) -> Result<AnalysisResult, PipelineError> {
        let text = match tokio::time::timeout(self.timeouts.extract, self.extractor.extract(path))
            .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(classify_extract_error(e)),
            Err(_) => {
                return Err(PipelineError::TransientInfra(format!(
                    "Text extraction timed out after {}s",
                    self.timeouts.extract.as_secs()
                )))
            }
        };

        let chars = text.trim().chars().count();
        if chars < MIN_TEXT_CHARS {
            debug!("Extracted {chars} characters from {}", path.display());
            return Err(PipelineError::Content(INSUFFICIENT_TEXT_MESSAGE.to_string()));
        }

        match tokio::time::timeout(self.timeouts.analyze, self.analyzer.analyze(&text)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(PipelineError::Service(e.to_string())),
            Err(_) => Err(PipelineError::TransientInfra(format!(
                "Analysis timed out after {}s",
                self.timeouts.analyze.as_secs()
            ))),
        }
    }

    /// Writes a terminal failure onto the record, or keeps the artifact for a retry.
    async fn settle_failure(
        &self,
        id: Uuid,
        artifact: LocalArtifact,
        err: PipelineError,
    ) -> PipelineError {
        if err.is_retryable() {
            warn!("Analysis {id} attempt failed ({:?}): {err}", err.kind());
            artifact.retain();
            return err;
        }

        warn!("Analysis {id} failed ({:?}): {err}", err.kind());
        match self.records.fail(id, &err.to_string()).await {
            Ok(_) => {
                drop(artifact);
                err
            }
            Err(db) => {
                error!("Could not mark analysis {id} failed: {db}");
                artifact.retain();
                PipelineError::infra(db)
            }
        }
    }

    /// Completion did not apply: the record was deleted or finished elsewhere.
    async fn discard(&self, id: Uuid, artifact: LocalArtifact) -> RoutineOutcome {
        match self.records.get(id).await {
            Ok(None) => {
                info!("Analysis {id} was deleted during processing; discarding results");
                drop(artifact);
                RoutineOutcome::Discarded
            }
            Ok(Some(record)) => {
                info!(
                    "Analysis {id} was finished elsewhere as {}; discarding results",
                    record.status
                );
                if record.status == AnalysisStatus::Completed {
                    artifact.retain();
                }
                RoutineOutcome::AlreadyFinished(record.status)
            }
            Err(e) => {
                warn!("Could not reload analysis {id}: {e}");
                artifact.retain();
                RoutineOutcome::Discarded
            }
        }
    }

    /// Moves a completed artifact to remote storage when it is configured.
    /// `None` means the record vanished before it could be relocated.
    async fn migrate(&self, job: &AnalysisJob, artifact: LocalArtifact) -> Option<ArtifactLocation> {
        let id = job.analysis_id;
        if !self.artifacts.remote_enabled() {
            return Some(ArtifactLocation::Local(artifact.retain()));
        }

        let upload = tokio::time::timeout(
            self.timeouts.storage,
            self.artifacts
                .migrate(job.user_id, &job.original_file_name, artifact.path()),
        )
        .await;
        let object = match upload {
            Ok(Ok(Some(object))) => object,
            Ok(Ok(None)) => return Some(ArtifactLocation::Local(artifact.retain())),
            Ok(Err(e)) => {
                warn!("Remote upload for analysis {id} failed, keeping local copy: {e}");
                return Some(ArtifactLocation::Local(artifact.retain()));
            }
            Err(_) => {
                warn!("Remote upload for analysis {id} timed out, keeping local copy");
                return Some(ArtifactLocation::Local(artifact.retain()));
            }
        };

        let remote = ArtifactLocation::Remote {
            url: object.url.clone(),
            key: object.key.clone(),
        };
        match self
            .records
            .relocate(id, &object.url, Some(&object.key))
            .await
        {
            Ok(true) => {
                debug!("Analysis {id} artifact moved to {}", object.url);
                drop(artifact);
                Some(remote)
            }
            Ok(false) => {
                info!("Analysis {id} was deleted before relocation; removing uploaded copy");
                self.artifacts.discard(&remote).await;
                drop(artifact);
                None
            }
            Err(e) => {
                warn!("Could not record remote location for analysis {id}: {e}");
                self.artifacts.discard(&remote).await;
                Some(ArtifactLocation::Local(artifact.retain()))
            }
        }
    }
}

fn classify_extract_error(err: ExtractError) -> PipelineError {
    match err {
        ExtractError::Unreadable(_) | ExtractError::Missing => {
            PipelineError::Content(err.to_string())
        }
        ExtractError::Io(_) => PipelineError::TransientInfra(err.to_string()),
    }
}

async fn release_path(path: &Path) {
    if let Err(e) = remove_local(path).await {
        warn!("Could not remove local artifact {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::models::user::PlanTier;
    use crate::testing::{Harness, SAMPLE_CV};

    struct StalledExtractor;

    #[async_trait]
    impl TextExtractor for StalledExtractor {
        async fn extract(&self, _path: &Path) -> Result<String, ExtractError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_extraction_times_out_as_retryable() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;
        let routine = ProcessingRoutine::new(
            h.records.clone(),
            QuotaTracker::new(h.users.clone()),
            Arc::new(StalledExtractor),
            h.analyzer.clone(),
            h.artifacts(),
            PipelineTimeouts::default(),
        );

        let err = routine.run(&job).await.unwrap_err();
        assert!(matches!(err, PipelineError::TransientInfra(_)));
        assert!(err.is_retryable());
        assert_eq!(
            h.records.record(job.analysis_id).status,
            AnalysisStatus::Processing
        );
        assert!(job.file_path.exists());
        assert_eq!(h.analyzer.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_analysis_times_out_as_retryable() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;
        h.analyzer.hang();

        let err = h.routine().run(&job).await.unwrap_err();
        assert!(matches!(err, PipelineError::TransientInfra(_)));
        assert!(err.is_retryable());
        assert_eq!(
            h.records.record(job.analysis_id).status,
            AnalysisStatus::Processing
        );
        assert!(job.file_path.exists());
        assert_eq!(h.users.count(user), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_remote_upload_completes_locally() {
        let h = Harness::with_remote();
        h.remote().hang_uploads();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;

        let outcome = h.routine().run(&job).await.unwrap();
        assert!(matches!(
            outcome,
            RoutineOutcome::Completed {
                location: ArtifactLocation::Local(_),
                ..
            }
        ));
        let record = h.records.record(job.analysis_id);
        assert_eq!(record.status, AnalysisStatus::Completed);
        assert!(record.storage_key.is_none());
        assert!(job.file_path.exists());
        assert_eq!(h.users.count(user), 1);
    }

    #[tokio::test]
    async fn test_completes_record_and_charges_once() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;

        let outcome = h.routine().run(&job).await.unwrap();
        assert!(matches!(outcome, RoutineOutcome::Completed { score: 82, .. }));

        let record = h.records.record(job.analysis_id);
        assert_eq!(record.status, AnalysisStatus::Completed);
        assert_eq!(record.score, Some(82));
        assert_eq!(h.users.count(user), 1);
        assert!(job.file_path.exists());
    }

    #[tokio::test]
    async fn test_redelivery_of_finished_job_is_a_no_op() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;
        let routine = h.routine();

        routine.run(&job).await.unwrap();
        let again = routine.run(&job).await.unwrap();

        assert_eq!(
            again,
            RoutineOutcome::AlreadyFinished(AnalysisStatus::Completed)
        );
        assert_eq!(h.analyzer.calls(), 1);
        assert_eq!(h.users.count(user), 1);
    }

    #[tokio::test]
    async fn test_short_text_fails_without_calling_analyzer() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, "Jane Doe. Engineer.").await;

        let err = h.routine().run(&job).await.unwrap_err();
        assert!(matches!(err, PipelineError::Content(_)));

        let record = h.records.record(job.analysis_id);
        assert_eq!(record.status, AnalysisStatus::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some(INSUFFICIENT_TEXT_MESSAGE)
        );
        assert_eq!(h.analyzer.calls(), 0);
        assert_eq!(h.users.count(user), 0);
        assert!(!job.file_path.exists());
    }

    #[tokio::test]
    async fn test_threshold_counts_the_document_spacing() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        // 103 characters as written, 83 once whitespace runs are collapsed.
        let spaced = vec!["Rust engineer"; 6].join("     ");
        assert_eq!(spaced.chars().count(), 103);
        let job = h.stage(user, &format!("\n{spaced}\n\n")).await;

        let outcome = h.routine().run(&job).await.unwrap();
        assert!(matches!(outcome, RoutineOutcome::Completed { .. }));
        assert_eq!(h.analyzer.calls(), 1);
    }

    #[tokio::test]
    async fn test_analyzer_failure_is_retryable_and_keeps_artifact() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;
        h.analyzer.fail_next(1);

        let err = h.routine().run(&job).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            h.records.record(job.analysis_id).status,
            AnalysisStatus::Processing
        );
        assert!(job.file_path.exists());
        assert_eq!(h.users.count(user), 0);
    }

    #[tokio::test]
    async fn test_missing_record_is_stale_and_drops_artifact() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;
        h.records.remove(job.analysis_id);

        let err = h.routine().run(&job).await.unwrap_err();
        assert!(matches!(err, PipelineError::RecordMissing(_)));
        assert!(!err.is_retryable());
        assert!(!job.file_path.exists());
    }

    #[tokio::test]
    async fn test_remote_storage_relocates_and_removes_local_copy() {
        let h = Harness::with_remote();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;

        let outcome = h.routine().run(&job).await.unwrap();
        let RoutineOutcome::Completed {
            location: ArtifactLocation::Remote { key, .. },
            ..
        } = outcome
        else {
            panic!("expected a remote location, got {outcome:?}");
        };

        let record = h.records.record(job.analysis_id);
        assert_eq!(record.storage_key.as_deref(), Some(key.as_str()));
        assert!(record.file_url.starts_with("https://"));
        assert!(h.remote().contains(&key));
        assert!(!job.file_path.exists());
    }

    #[tokio::test]
    async fn test_remote_upload_failure_keeps_local_copy() {
        let h = Harness::with_remote();
        h.remote().fail_uploads(true);
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;

        let outcome = h.routine().run(&job).await.unwrap();
        assert!(matches!(
            outcome,
            RoutineOutcome::Completed {
                location: ArtifactLocation::Local(_),
                ..
            }
        ));
        let record = h.records.record(job.analysis_id);
        assert_eq!(record.status, AnalysisStatus::Completed);
        assert!(record.storage_key.is_none());
        assert!(job.file_path.exists());
    }

    #[tokio::test]
    async fn test_record_deleted_mid_flight_is_not_recreated() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;
        h.records.remove_on_complete(job.analysis_id);

        let outcome = h.routine().run(&job).await.unwrap();
        assert_eq!(outcome, RoutineOutcome::Discarded);
        assert!(h.records.find(job.analysis_id).is_none());
        assert_eq!(h.users.count(user), 0);
        assert!(!job.file_path.exists());
    }

    #[tokio::test]
    async fn test_abandon_marks_failed_and_removes_artifact() {
        let h = Harness::new();
        let user = h.users.insert(PlanTier::Free, 0, chrono::Utc::now());
        let job = h.stage(user, SAMPLE_CV).await;

        assert!(h.routine().abandon(&job, "broker down").await.unwrap());
        let record = h.records.record(job.analysis_id);
        assert_eq!(record.status, AnalysisStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("broker down"));
        assert!(!job.file_path.exists());
    }
}
