use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::models::analysis::{AnalysisResult, AnalysisRow, NewAnalysis};
use crate::models::user::User;
use crate::store::{AnalysisStore, UserStore};

#[derive(Clone)]
pub struct PgAnalysisStore {
    pool: PgPool,
}

impl PgAnalysisStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalysisStore for PgAnalysisStore {
    async fn create(&self, new: NewAnalysis) -> Result<AnalysisRow> {
        let row = sqlx::query_as::<_, AnalysisRow>(
            r#"
            INSERT INTO analyses (id, user_id, original_file_name, file_url, status)
            VALUES ($1, $2, $3, $4, 'processing')
            RETURNING *
            "#,
        )
        .bind(new.id)
        .bind(new.user_id)
        .bind(&new.original_file_name)
        .bind(&new.file_url)
        .fetch_one(&self.pool)
        .await?;

        debug!("Created analysis {} for user {}", row.id, row.user_id);
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<AnalysisRow>> {
        Ok(
            sqlx::query_as::<_, AnalysisRow>("SELECT * FROM analyses WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn get_owned(&self, id: Uuid, user_id: Uuid) -> Result<Option<AnalysisRow>> {
        Ok(sqlx::query_as::<_, AnalysisRow>(
            "SELECT * FROM analyses WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_completed(&self, user_id: Uuid, limit: i64) -> Result<Vec<AnalysisRow>> {
        Ok(sqlx::query_as::<_, AnalysisRow>(
            r#"
            SELECT * FROM analyses
            WHERE user_id = $1 AND status = 'completed'
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn complete(
        &self,
        id: Uuid,
        result: &AnalysisResult,
        processing_time_ms: i64,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE analyses
            SET status = 'completed',
                score = $2,
                strengths = $3,
                weaknesses = $4,
                missing_skills = $5,
                improvements = $6,
                extracted_data = $7,
                ats_compatible = $8,
                processing_time_ms = $9,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(result.score)
        .bind(&result.strengths)
        .bind(&result.weaknesses)
        .bind(&result.missing_skills)
        .bind(Json(&result.improvements))
        .bind(Json(&result.extracted_data))
        .bind(result.ats_compatible)
        .bind(processing_time_ms)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn fail(&self, id: Uuid, message: &str) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE analyses
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn relocate(&self, id: Uuid, file_url: &str, storage_key: Option<&str>) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE analyses SET file_url = $2, storage_key = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(file_url)
        .bind(storage_key)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn save_optimized(&self, id: Uuid, optimized: &str) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE analyses SET optimized_version = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'completed'
            "#,
        )
        .bind(id)
        .bind(optimized)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn delete(&self, id: Uuid, user_id: Uuid) -> Result<Option<AnalysisRow>> {
        Ok(sqlx::query_as::<_, AnalysisRow>(
            "DELETE FROM analyses WHERE id = $1 AND user_id = $2 RETURNING *",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, plan_type, analyses_count, monthly_analyses_reset, created_at
            FROM users WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn reset_monthly(&self, id: Uuid, anchor: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE users SET analyses_count = 0, monthly_analyses_reset = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(anchor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_analyses(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE users SET analyses_count = analyses_count + 1 WHERE id = $1 AND plan_type = 'free'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
