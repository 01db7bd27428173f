//! On-demand rewrite of an analysed CV.
//!
//! Runs outside the pipeline: the caller waits for the rewrite. The result is
//! cached on the record, so repeated requests return the stored text.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::analysis::analyzer::{CvAnalyzer, OptimizationContext};
use crate::analysis::extractor::{ExtractError, TextExtractor};
use crate::config::PipelineTimeouts;
use crate::errors::AppError;
use crate::models::analysis::AnalysisStatus;
use crate::storage::{ArtifactLocation, ArtifactStore, StorageError};
use crate::store::AnalysisStore;

#[derive(Debug, Clone, Serialize)]
pub struct OptimizedCv {
    pub analysis_id: Uuid,
    pub optimized_version: String,
    pub cached: bool,
}

pub struct Optimizer<'a> {
    pub records: &'a Arc<dyn AnalysisStore>,
    pub artifacts: &'a ArtifactStore,
    pub extractor: &'a Arc<dyn TextExtractor>,
    pub analyzer: &'a Arc<dyn CvAnalyzer>,
    pub timeouts: PipelineTimeouts,
}

impl Optimizer<'_> {
    pub async fn optimize(&self, id: Uuid, user_id: Uuid) -> Result<OptimizedCv, AppError> {
        let record = self
            .records
            .get_owned(id, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Analysis {id} not found")))?;

        if record.status != AnalysisStatus::Completed {
            return Err(AppError::Validation(format!(
                "Analysis {id} is {}; only completed analyses can be optimized",
                record.status
            )));
        }

        if let Some(optimized_version) = record.optimized_version.clone() {
            return Ok(OptimizedCv {
                analysis_id: id,
                optimized_version,
                cached: true,
            });
        }

        let fetched = tokio::time::timeout(
            self.timeouts.storage,
            self.artifacts.fetch(&ArtifactLocation::of(&record)),
        )
        .await
        .map_err(|_| AppError::Storage("fetching the original document timed out".to_string()))?
        .map_err(|e| match e {
            StorageError::Rejected(msg) => AppError::UnprocessableEntity(msg),
            other => AppError::Storage(other.to_string()),
        })?;

        let text = tokio::time::timeout(self.timeouts.extract, self.extractor.extract(fetched.path()))
            .await
            .map_err(|_| AppError::Internal(anyhow::anyhow!("text extraction timed out")))?
            .map_err(|e| match e {
                ExtractError::Io(io) => AppError::Internal(io.into()),
                other => AppError::UnprocessableEntity(other.to_string()),
            })?;

        let context = OptimizationContext {
            score: record.score.unwrap_or_default(),
            weaknesses: record.weaknesses.clone().unwrap_or_default(),
            missing_skills: record.missing_skills.clone().unwrap_or_default(),
        };
        let optimized_version =
            tokio::time::timeout(self.timeouts.analyze, self.analyzer.optimize(&text, &context))
                .await
                .map_err(|_| AppError::Llm("rewrite timed out".to_string()))?
                .map_err(|e| AppError::Llm(e.to_string()))?;

        // A record deleted meanwhile just doesn't keep the rewrite.
        self.records.save_optimized(id, &optimized_version).await?;
        info!("Optimized version generated for analysis {id}");

        Ok(OptimizedCv {
            analysis_id: id,
            optimized_version,
            cached: false,
        })
    }
}
