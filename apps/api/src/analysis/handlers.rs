use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::analysis::optimize::{OptimizedCv, Optimizer};
use crate::errors::AppError;
use crate::models::analysis::{AnalysisRow, AnalysisStatus, AnalysisSummary};
use crate::pipeline::{DispatchOutcome, Upload};
use crate::state::AppState;
use crate::storage::ArtifactLocation;

/// Completed analyses returned by the history endpoint.
const HISTORY_LIMIT: i64 = 20;

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub analysis_id: Uuid,
    pub job_id: String,
    pub status: AnalysisStatus,
}

/// POST /api/v1/analyses
///
/// 202 when queued, 200 with the completed record when processed inline,
/// 422 with the failed record when inline processing failed.
pub async fn handle_upload(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("cv") {
            continue;
        }
        let original_file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation("The cv field has no file name".to_string()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("Could not read upload: {e}")))?;
        upload = Some(Upload {
            user_id: params.user_id,
            original_file_name,
            bytes,
        });
        break;
    }
    let upload = upload.ok_or_else(|| AppError::Validation("No file uploaded".to_string()))?;

    info!(
        "Upload '{}' ({} bytes) from user {}",
        upload.original_file_name,
        upload.bytes.len(),
        upload.user_id
    );

    let response = match state.dispatcher.dispatch(upload).await? {
        DispatchOutcome::Accepted {
            analysis_id,
            job_id,
        } => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse {
                analysis_id,
                job_id,
                status: AnalysisStatus::Processing,
            }),
        )
            .into_response(),
        DispatchOutcome::Finished(record) => {
            let status = match record.status {
                AnalysisStatus::Failed => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::OK,
            };
            (status, Json(record)).into_response()
        }
    };
    Ok(response)
}

/// GET /api/v1/analyses
pub async fn handle_history(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<Vec<AnalysisSummary>>, AppError> {
    let rows = state
        .records
        .list_completed(params.user_id, HISTORY_LIMIT)
        .await?;
    Ok(Json(rows.into_iter().map(AnalysisSummary::from).collect()))
}

/// GET /api/v1/analyses/:id
pub async fn handle_get_analysis(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<AnalysisRow>, AppError> {
    let record = state
        .records
        .get_owned(id, params.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Analysis {id} not found")))?;
    Ok(Json(record))
}

/// POST /api/v1/analyses/:id/optimize
pub async fn handle_optimize(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<OptimizedCv>, AppError> {
    let optimized = Optimizer {
        records: &state.records,
        artifacts: &state.artifacts,
        extractor: &state.extractor,
        analyzer: &state.analyzer,
        timeouts: state.timeouts,
    }
    .optimize(id, params.user_id)
    .await?;
    Ok(Json(optimized))
}

/// DELETE /api/v1/analyses/:id
pub async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = state
        .records
        .delete(id, params.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Analysis {id} not found")))?;

    // An in-flight job notices the missing record and cleans up after itself.
    if record.status != AnalysisStatus::Processing {
        state
            .artifacts
            .discard(&ArtifactLocation::of(&record))
            .await;
    }
    info!("Analysis {id} deleted by user {}", params.user_id);

    Ok(Json(json!({ "deleted": true, "analysis_id": id })))
}
