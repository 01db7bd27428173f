// Shared prompt fragments. Each service that needs LLM calls defines its own
// prompts.rs alongside it; this file holds the cross-cutting pieces.

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Instruction appended to every prompt that rewrites user content.
pub const TRUTHFULNESS_INSTRUCTION: &str = "\
    CRITICAL: Keep every fact from the original document true. \
    Do NOT invent employers, dates, degrees, metrics or skills the candidate did not list.";
