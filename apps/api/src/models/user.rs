use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Premium,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Premium => "premium",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown plan tier '{0}'")]
pub struct UnknownPlan(pub String);

impl TryFrom<String> for PlanTier {
    type Error = UnknownPlan;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "free" => Ok(PlanTier::Free),
            "premium" => Ok(PlanTier::Premium),
            _ => Err(UnknownPlan(value)),
        }
    }
}

/// Owner account with its monthly usage counter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[sqlx(try_from = "String")]
    pub plan_type: PlanTier,
    pub analyses_count: i32,
    /// Anchor of the current counting month.
    pub monthly_analyses_reset: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
