//! Record Store and Quota Store.
//!
//! The pipeline talks to persistence only through these traits. `postgres`
//! holds the production implementation; tests use in-memory fakes.
//!
//! Every status transition is a compare-and-set on `processing`: the returned
//! `bool` says whether the transition applied. `false` means the record was
//! already terminal or has been deleted, and the caller must not apply any
//! completion side effects.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::analysis::{AnalysisResult, AnalysisRow, NewAnalysis};
use crate::models::user::User;

pub mod postgres;

pub use postgres::{PgAnalysisStore, PgUserStore};

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Inserts a record in `processing`.
    async fn create(&self, new: NewAnalysis) -> Result<AnalysisRow>;

    async fn get(&self, id: Uuid) -> Result<Option<AnalysisRow>>;

    async fn get_owned(&self, id: Uuid, user_id: Uuid) -> Result<Option<AnalysisRow>>;

    /// Most recent completed analyses first.
    async fn list_completed(&self, user_id: Uuid, limit: i64) -> Result<Vec<AnalysisRow>>;

    async fn complete(
        &self,
        id: Uuid,
        result: &AnalysisResult,
        processing_time_ms: i64,
    ) -> Result<bool>;

    async fn fail(&self, id: Uuid, message: &str) -> Result<bool>;

    /// Points the record at a new artifact location.
    async fn relocate(&self, id: Uuid, file_url: &str, storage_key: Option<&str>) -> Result<bool>;

    async fn save_optimized(&self, id: Uuid, optimized: &str) -> Result<bool>;

    /// Removes the record, returning it if it existed and belonged to `user_id`.
    async fn delete(&self, id: Uuid, user_id: Uuid) -> Result<Option<AnalysisRow>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<User>>;

    /// Zeroes the monthly counter and moves the anchor to `anchor`.
    async fn reset_monthly(&self, id: Uuid, anchor: DateTime<Utc>) -> Result<()>;

    /// Adds one to the monthly counter of a free-tier owner. Premium owners are untouched.
    async fn increment_analyses(&self, id: Uuid) -> Result<()>;
}
