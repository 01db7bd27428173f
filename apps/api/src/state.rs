use std::sync::Arc;

use crate::analysis::analyzer::CvAnalyzer;
use crate::analysis::extractor::TextExtractor;
use crate::config::PipelineTimeouts;
use crate::pipeline::Dispatcher;
use crate::queue::BrokerMonitor;
use crate::storage::ArtifactStore;
use crate::store::AnalysisStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn AnalysisStore>,
    pub artifacts: ArtifactStore,
    pub extractor: Arc<dyn TextExtractor>,
    /// Also serves on-demand rewrites, outside the pipeline.
    pub analyzer: Arc<dyn CvAnalyzer>,
    pub dispatcher: Arc<Dispatcher>,
    /// Read by the health endpoint; the dispatcher holds its own handle.
    pub monitor: Arc<BrokerMonitor>,
    pub timeouts: PipelineTimeouts,
}
