use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of an analysis record. `Processing` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnalysisStatus::Processing)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown analysis status '{0}'")]
pub struct UnknownStatus(pub String);

impl TryFrom<String> for AnalysisStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "processing" => Ok(AnalysisStatus::Processing),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            _ => Err(UnknownStatus(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub category: String,
    pub suggestion: String,
}

/// Structured fields lifted out of the document by the analysis collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedData {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub skills: Vec<String>,
    pub experience: Vec<String>,
    pub education: Vec<String>,
}

/// Output of the content-analysis collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub score: i32,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub missing_skills: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<Improvement>,
    #[serde(default)]
    pub extracted_data: ExtractedData,
    #[serde(default)]
    pub ats_compatible: bool,
}

/// A persisted analysis record.
///
/// Result fields are `Some` only once `status` is `Completed`;
/// `error_message` is `Some` only once `status` is `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnalysisRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_file_name: String,
    /// Local path while the artifact lives on disk, remote URL after migration.
    pub file_url: String,
    /// Remote object key, set together with a remote `file_url`.
    pub storage_key: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: AnalysisStatus,
    pub score: Option<i32>,
    pub strengths: Option<Vec<String>>,
    pub weaknesses: Option<Vec<String>>,
    pub missing_skills: Option<Vec<String>>,
    pub improvements: Option<Json<Vec<Improvement>>>,
    pub extracted_data: Option<Json<ExtractedData>>,
    pub ats_compatible: Option<bool>,
    pub optimized_version: Option<String>,
    pub error_message: Option<String>,
    pub processing_time_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// History list entry: a record without its extracted fields and rewrite.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub id: Uuid,
    pub original_file_name: String,
    pub file_url: String,
    pub status: AnalysisStatus,
    pub score: Option<i32>,
    pub strengths: Option<Vec<String>>,
    pub weaknesses: Option<Vec<String>>,
    pub missing_skills: Option<Vec<String>>,
    pub improvements: Option<Json<Vec<Improvement>>>,
    pub ats_compatible: Option<bool>,
    pub processing_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl From<AnalysisRow> for AnalysisSummary {
    fn from(row: AnalysisRow) -> Self {
        Self {
            id: row.id,
            original_file_name: row.original_file_name,
            file_url: row.file_url,
            status: row.status,
            score: row.score,
            strengths: row.strengths,
            weaknesses: row.weaknesses,
            missing_skills: row.missing_skills,
            improvements: row.improvements,
            ats_compatible: row.ats_compatible,
            processing_time_ms: row.processing_time_ms,
            created_at: row.created_at,
        }
    }
}

/// Fields supplied when a record is first created in `Processing`.
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_file_name: String,
    pub file_url: String,
}

impl AnalysisRow {
    /// Builds the in-flight record for a freshly accepted upload.
    pub fn processing(new: NewAnalysis, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            user_id: new.user_id,
            original_file_name: new.original_file_name,
            file_url: new.file_url,
            storage_key: None,
            status: AnalysisStatus::Processing,
            score: None,
            strengths: None,
            weaknesses: None,
            missing_skills: None,
            improvements: None,
            extracted_data: None,
            ats_compatible: None,
            optimized_version: None,
            error_message: None,
            processing_time_ms: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a completed result. Only valid from `Processing`.
    pub fn apply_result(&mut self, result: &AnalysisResult, processing_time_ms: i64) {
        self.status = AnalysisStatus::Completed;
        self.score = Some(result.score);
        self.strengths = Some(result.strengths.clone());
        self.weaknesses = Some(result.weaknesses.clone());
        self.missing_skills = Some(result.missing_skills.clone());
        self.improvements = Some(Json(result.improvements.clone()));
        self.extracted_data = Some(Json(result.extracted_data.clone()));
        self.ats_compatible = Some(result.ats_compatible);
        self.processing_time_ms = processing_time_ms;
        self.updated_at = Utc::now();
    }

    /// Applies a failure. Only valid from `Processing`.
    pub fn apply_failure(&mut self, message: &str) {
        self.status = AnalysisStatus::Failed;
        self.error_message = Some(message.to_string());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            AnalysisStatus::Processing,
            AnalysisStatus::Completed,
            AnalysisStatus::Failed,
        ] {
            let parsed = AnalysisStatus::try_from(status.as_str().to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(AnalysisStatus::try_from("pending".to_string()).is_err());
    }

    #[test]
    fn test_only_processing_is_non_terminal() {
        assert!(!AnalysisStatus::Processing.is_terminal());
        assert!(AnalysisStatus::Completed.is_terminal());
        assert!(AnalysisStatus::Failed.is_terminal());
    }

    #[test]
    fn test_analysis_result_parses_collaborator_json() {
        let raw = r#"{
            "score": 72,
            "strengths": ["Clear structure"],
            "weaknesses": ["Few metrics"],
            "missingSkills": ["Kubernetes"],
            "improvements": [{"category": "Format", "suggestion": "Add a skills section"}],
            "extractedData": {"name": "Ada", "skills": ["Rust"]},
            "atsCompatible": true
        }"#;
        let result: AnalysisResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.score, 72);
        assert_eq!(result.missing_skills, vec!["Kubernetes"]);
        assert_eq!(result.extracted_data.name.as_deref(), Some("Ada"));
        assert!(result.extracted_data.education.is_empty());
        assert!(result.ats_compatible);
    }

    #[test]
    fn test_result_fields_present_only_after_completion() {
        let mut row = AnalysisRow::processing(
            NewAnalysis {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                original_file_name: "cv.pdf".to_string(),
                file_url: "uploads/cv.pdf".to_string(),
            },
            Utc::now(),
        );
        assert!(row.score.is_none() && row.error_message.is_none());

        let result = AnalysisResult {
            score: 80,
            strengths: vec![],
            weaknesses: vec![],
            missing_skills: vec![],
            improvements: vec![],
            extracted_data: ExtractedData::default(),
            ats_compatible: false,
        };
        row.apply_result(&result, 1500);
        assert_eq!(row.status, AnalysisStatus::Completed);
        assert_eq!(row.score, Some(80));
        assert!(row.error_message.is_none());
    }
}
