//! Content-analysis collaborator: pluggable, trait-based.
//!
//! Default: `LlmCvAnalyzer` (Claude through `LlmClient`).
//! Without an API key the service runs `StaticCvAnalyzer`, which returns a
//! fixed demonstration assessment so the rest of the pipeline stays usable.
//!
//! `AppState` and the processing routine hold an `Arc<dyn CvAnalyzer>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::prompts::{
    ANALYSIS_PROMPT_TEMPLATE, ANALYSIS_SYSTEM, OPTIMIZE_PROMPT_TEMPLATE, OPTIMIZE_SYSTEM,
};
use crate::llm_client::prompts::{JSON_ONLY_SYSTEM, TRUTHFULNESS_INSTRUCTION};
use crate::llm_client::{LlmClient, LlmError};
use crate::models::analysis::{AnalysisResult, ExtractedData, Improvement};

/// Longest document excerpt sent to the model.
const MAX_PROMPT_CHARS: usize = 20_000;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("Analysis service error: {0}")]
    Llm(#[from] LlmError),

    #[error("Analysis service returned malformed output: {0}")]
    Malformed(String),
}

/// What the rewrite collaborator needs to know about the earlier assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationContext {
    pub score: i32,
    pub weaknesses: Vec<String>,
    pub missing_skills: Vec<String>,
}

#[async_trait]
pub trait CvAnalyzer: Send + Sync {
    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;

    async fn analyze(&self, text: &str) -> Result<AnalysisResult, AnalyzerError>;

    async fn optimize(
        &self,
        text: &str,
        context: &OptimizationContext,
    ) -> Result<String, AnalyzerError>;
}

// ────────────────────────────────────────────────────────────────────────────
// LlmCvAnalyzer
// ────────────────────────────────────────────────────────────────────────────

pub struct LlmCvAnalyzer(pub LlmClient);

#[async_trait]
impl CvAnalyzer for LlmCvAnalyzer {
    fn backend(&self) -> &'static str {
        "llm"
    }

    async fn analyze(&self, text: &str) -> Result<AnalysisResult, AnalyzerError> {
        let prompt =
            ANALYSIS_PROMPT_TEMPLATE.replace("{cv_text}", truncate_chars(text, MAX_PROMPT_CHARS));
        let system = format!("{ANALYSIS_SYSTEM} {JSON_ONLY_SYSTEM}");
        let result = self.0.call_json::<AnalysisResult>(&prompt, &system).await?;
        validate_result(result)
    }

    async fn optimize(
        &self,
        text: &str,
        context: &OptimizationContext,
    ) -> Result<String, AnalyzerError> {
        let prompt = build_optimize_prompt(text, context);
        Ok(self.0.call_text(&prompt, OPTIMIZE_SYSTEM).await?)
    }
}

fn build_optimize_prompt(text: &str, context: &OptimizationContext) -> String {
    OPTIMIZE_PROMPT_TEMPLATE
        .replace("{cv_text}", truncate_chars(text, MAX_PROMPT_CHARS))
        .replace("{score}", &context.score.to_string())
        .replace("{weaknesses}", &context.weaknesses.join(", "))
        .replace("{missing_skills}", &context.missing_skills.join(", "))
        .replace("{truthfulness}", TRUTHFULNESS_INSTRUCTION)
}

/// Rejects collaborator output that breaks the result contract.
pub fn validate_result(result: AnalysisResult) -> Result<AnalysisResult, AnalyzerError> {
    if !(0..=100).contains(&result.score) {
        return Err(AnalyzerError::Malformed(format!(
            "score {} is outside 0-100",
            result.score
        )));
    }
    Ok(result)
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// StaticCvAnalyzer: offline fallback
// ────────────────────────────────────────────────────────────────────────────

pub struct StaticCvAnalyzer;

#[async_trait]
impl CvAnalyzer for StaticCvAnalyzer {
    fn backend(&self) -> &'static str {
        "static"
    }

    async fn analyze(&self, _text: &str) -> Result<AnalysisResult, AnalyzerError> {
        Ok(AnalysisResult {
            score: 70,
            strengths: vec![
                "Clear structure".to_string(),
                "Relevant experience".to_string(),
            ],
            weaknesses: vec![
                "Few quantified results".to_string(),
                "No dedicated skills section".to_string(),
            ],
            missing_skills: vec!["Leadership".to_string(), "Project management".to_string()],
            improvements: vec![Improvement {
                category: "Format".to_string(),
                suggestion: "Add a key skills section".to_string(),
            }],
            extracted_data: ExtractedData {
                name: Some("Sample Candidate".to_string()),
                email: Some("candidate@example.com".to_string()),
                phone: None,
                skills: vec!["React".to_string(), "Node.js".to_string()],
                experience: vec!["Full-stack developer - 3 years".to_string()],
                education: vec!["MSc Computer Science".to_string()],
            },
            ats_compatible: true,
        })
    }

    async fn optimize(
        &self,
        _text: &str,
        _context: &OptimizationContext,
    ) -> Result<String, AnalyzerError> {
        Ok("# Optimised Resume\n\n\
            ## Experience\n\
            - Full-stack developer | Example Corp\n  \
            - Shipped React and Node.js features\n\n\
            ## Skills\n\
            - React, Node.js, PostgreSQL\n\n\
            ## Education\n\
            - MSc Computer Science"
            .to_string())
    }
}
