use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ReferralStatus {
    PendingGroupJoin,
    Verified,
    ExistingMemberNoReward,
    Rejoined,
}

/// One (referrer, referred) relationship. A referred account can only ever
/// have a single referral row; later referrers never get one.
#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct Referral {
    pub id: String,
    pub referrer_id: String,
    pub referred_id: String,
    pub referral_code: String,
    pub status: ReferralStatus,
    pub group_join_verified: bool,
    pub group_join_date: Option<DateTime<Utc>>,
    pub reward_given: bool,
    pub rejoin_count: i64,
    pub last_rejoin_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Referral {
    pub fn open(
        referrer_id: &str,
        referred_id: &str,
        referral_code: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Referral {
            id: Uuid::new_v4().hyphenated().to_string(),
            referrer_id: referrer_id.to_string(),
            referred_id: referred_id.to_string(),
            referral_code: referral_code.to_string(),
            status: ReferralStatus::PendingGroupJoin,
            group_join_verified: false,
            group_join_date: None,
            reward_given: false,
            rejoin_count: 0,
            last_rejoin_date: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Business rejection reasons for `open`. These are outcomes, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    SelfReferral,
    DuplicatePair,
    AlreadyReferredByOther,
    PreExistingMember,
    ReferrerAbusePattern,
    StaleCandidateAccount,
    UnknownReferralCode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    Created { referral_id: String },
    Rejected(RejectReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyRejection {
    RejoinDetected,
    ExistingMember,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Settled { referrer_id: String, amount: i64 },
    Rejected(VerifyRejection),
    NoOp,
}
