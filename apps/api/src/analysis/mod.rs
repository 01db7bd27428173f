// Document analysis: the collaborators the pipeline calls (text extraction,
// content analysis, rewrite), the on-demand rewrite service, and the HTTP
// handlers for analysis records.
// All LLM calls go through llm_client; no direct Anthropic calls here.

pub mod analyzer;
pub mod extractor;
pub mod handlers;
pub mod optimize;
pub mod prompts;
