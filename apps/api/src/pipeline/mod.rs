//! Analysis pipeline.
//!
//! - `dispatcher`: entry point for uploads; picks queued or inline processing
//! - `routine`: extract → analyze → persist → charge → migrate, shared by both paths
//! - `quota`: per-owner monthly counter
//! - `error`: failure taxonomy driving retry decisions

pub mod dispatcher;
pub mod error;
pub mod quota;
pub mod routine;

pub use dispatcher::{DispatchOutcome, Dispatcher, Upload};
pub use error::{ErrorKind, PipelineError};
pub use quota::QuotaTracker;
pub use routine::{ProcessingRoutine, RoutineOutcome};
