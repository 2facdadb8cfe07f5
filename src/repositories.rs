use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::earnings::{Earning, SettleOutcome};
use crate::models::referrals::Referral;
use crate::models::users::{User, UserProfile};

pub mod memory;
pub mod referrals;
pub mod rewards;
pub mod users;

/// Keyed store of user profiles. The engine reads account age and referral
/// codes from it; reward mutations go through `RewardLedger` only.
#[async_trait]
pub trait UserLedger: Send + Sync {
    async fn get(&self, account_id: &str) -> Result<Option<User>, anyhow::Error>;

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<User>, anyhow::Error>;

    /// Creates the user on first contact; later calls only refresh display
    /// fields, `last_active` and `updated_at`.
    async fn upsert_profile(
        &self,
        profile: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<User, anyhow::Error>;
}

/// Keyed store of referral relationships, the state machine's primary data.
#[async_trait]
pub trait ReferralLedger: Send + Sync {
    async fn insert(&self, referral: &Referral) -> Result<(), anyhow::Error>;

    async fn find_by_pair(
        &self,
        referrer_id: &str,
        referred_id: &str,
    ) -> Result<Option<Referral>, anyhow::Error>;

    /// Newest first.
    async fn find_by_referred(&self, referred_id: &str) -> Result<Vec<Referral>, anyhow::Error>;

    async fn find_pending(&self, referred_id: &str) -> Result<Option<Referral>, anyhow::Error>;

    async fn record_rejoin(&self, referral_id: &str, now: DateTime<Utc>)
        -> Result<(), anyhow::Error>;

    async fn mark_rejoined(&self, referral_id: &str, now: DateTime<Utc>)
        -> Result<(), anyhow::Error>;

    async fn mark_existing_member(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error>;

    /// Conditional claim: flips `pending_group_join` to `verified` and sets
    /// `reward_given` only if the prior status was still pending. Returns
    /// false when a concurrent caller already claimed the row.
    async fn claim_pending(&self, referral_id: &str, now: DateTime<Utc>)
        -> Result<bool, anyhow::Error>;

    /// Rolls a claimed row back to `pending_group_join` after a settlement
    /// failure.
    async fn release_claim(&self, referral_id: &str, now: DateTime<Utc>)
        -> Result<(), anyhow::Error>;
}

/// Sole writer of balance/earnings/referral counters and of earnings rows.
#[async_trait]
pub trait RewardLedger: Send + Sync {
    /// Credits the referrer and appends the audit entry as one unit; nothing
    /// is written when the referrer cannot be found.
    async fn settle(
        &self,
        referrer_id: &str,
        referral_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, anyhow::Error>;

    async fn earnings_for_user(&self, user_id: &str) -> Result<Vec<Earning>, anyhow::Error>;
}
