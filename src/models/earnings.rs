use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EARNING_KIND_REFERRAL: &str = "referral";

/// Immutable audit entry written once per rewarded referral.
#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct Earning {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub kind: String,
    pub referral_id: String,
    pub created_at: DateTime<Utc>,
}

impl Earning {
    pub fn referral(user_id: &str, amount: i64, referral_id: &str, now: DateTime<Utc>) -> Self {
        Earning {
            id: Uuid::new_v4().hyphenated().to_string(),
            user_id: user_id.to_string(),
            amount,
            kind: EARNING_KIND_REFERRAL.to_string(),
            referral_id: referral_id.to_string(),
            created_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    Ok,
    ReferrerMissing,
}
