//! Quota Tracker: per-owner monthly analysis counter.
//!
//! Free owners get `FREE_MONTHLY_LIMIT` completed analyses per calendar month.
//! The counter is reset lazily: the first check made in a month later than the
//! stored anchor zeroes it and moves the anchor to "now". Premium owners are
//! never counted or limited.
//!
//! Check-and-reset is not atomic across concurrent requests of the same owner.
//! That is acceptable for a soft business limit; the persisted row stays
//! authoritative after each reset.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::user::{PlanTier, User};
use crate::pipeline::error::PipelineError;
use crate::store::UserStore;

pub const FREE_MONTHLY_LIMIT: i32 = 3;

/// True when `now` falls in a later calendar month than `anchor`.
pub fn month_rolled_over(anchor: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.year() != anchor.year() || now.month() != anchor.month()
}

/// Pure quota decision for an owner whose counter is already current.
pub fn within_quota(user: &User) -> bool {
    match user.plan_type {
        PlanTier::Premium => true,
        PlanTier::Free => user.analyses_count < FREE_MONTHLY_LIMIT,
    }
}

#[derive(Clone)]
pub struct QuotaTracker {
    users: Arc<dyn UserStore>,
}

impl QuotaTracker {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    pub async fn can_analyze(&self, user_id: Uuid) -> Result<bool, PipelineError> {
        self.can_analyze_at(user_id, Utc::now()).await
    }

    /// Checks the owner's quota as of `now`, resetting the monthly counter first
    /// when the month has rolled over.
    pub async fn can_analyze_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let mut user = self
            .users
            .get(user_id)
            .await
            .map_err(PipelineError::infra)?
            .ok_or_else(|| PipelineError::Validation(format!("Unknown user {user_id}")))?;

        if user.plan_type == PlanTier::Premium {
            return Ok(true);
        }

        if month_rolled_over(user.monthly_analyses_reset, now) {
            self.users
                .reset_monthly(user_id, now)
                .await
                .map_err(PipelineError::infra)?;
            info!(
                "Monthly analysis counter reset for user {user_id} (was {})",
                user.analyses_count
            );
            user.analyses_count = 0;
            user.monthly_analyses_reset = now;
        }

        let allowed = within_quota(&user);
        debug!(
            "Quota check for user {user_id}: {}/{} -> {allowed}",
            user.analyses_count, FREE_MONTHLY_LIMIT
        );
        Ok(allowed)
    }

    /// Charges one completed analysis to the owner.
    pub async fn charge(&self, user_id: Uuid) -> Result<(), PipelineError> {
        self.users
            .increment_analyses(user_id)
            .await
            .map_err(PipelineError::infra)
    }
}
