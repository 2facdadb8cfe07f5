use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::models::earnings::{Earning, SettleOutcome};
use crate::models::referrals::{Referral, ReferralStatus};
use crate::models::users::{User, UserProfile};
use crate::repositories::{ReferralLedger, RewardLedger, UserLedger};

/// In-memory ledger backend. Backs the `memory` storage mode (the bot's
/// no-database fallback) and the engine tests. Mutations go through dashmap
/// entry guards, so the claim semantics match the SQL conditional update.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    referrals: DashMap<String, Referral>,
    earnings: DashMap<String, Earning>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserLedger for MemoryStore {
    async fn get(&self, account_id: &str) -> Result<Option<User>, anyhow::Error> {
        Ok(self.users.get(account_id).map(|u| u.value().clone()))
    }

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<User>, anyhow::Error> {
        Ok(self
            .users
            .iter()
            .find(|u| u.referral_code == code)
            .map(|u| u.value().clone()))
    }

    async fn upsert_profile(
        &self,
        profile: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<User, anyhow::Error> {
        if let Some(mut existing) = self.users.get_mut(&profile.id) {
            existing.username = profile.username.clone();
            existing.first_name = profile.first_name.clone();
            existing.last_name = profile.last_name.clone();
            existing.last_active = now;
            existing.updated_at = now;
            return Ok(existing.value().clone());
        }

        let user = User::new(profile, now);
        self.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }
}

#[async_trait]
impl ReferralLedger for MemoryStore {
    async fn insert(&self, referral: &Referral) -> Result<(), anyhow::Error> {
        // Same constraint as the unique index on referred_id.
        if self
            .referrals
            .iter()
            .any(|r| r.referred_id == referral.referred_id)
        {
            bail!("referral already exists for referred {}", referral.referred_id);
        }

        self.referrals.insert(referral.id.clone(), referral.clone());
        Ok(())
    }

    async fn find_by_pair(
        &self,
        referrer_id: &str,
        referred_id: &str,
    ) -> Result<Option<Referral>, anyhow::Error> {
        Ok(self
            .referrals
            .iter()
            .find(|r| r.referrer_id == referrer_id && r.referred_id == referred_id)
            .map(|r| r.value().clone()))
    }

    async fn find_by_referred(&self, referred_id: &str) -> Result<Vec<Referral>, anyhow::Error> {
        let mut referrals: Vec<Referral> = self
            .referrals
            .iter()
            .filter(|r| r.referred_id == referred_id)
            .map(|r| r.value().clone())
            .collect();
        referrals.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(referrals)
    }

    async fn find_pending(&self, referred_id: &str) -> Result<Option<Referral>, anyhow::Error> {
        Ok(self
            .referrals
            .iter()
            .find(|r| {
                r.referred_id == referred_id && r.status == ReferralStatus::PendingGroupJoin
            })
            .map(|r| r.value().clone()))
    }

    async fn record_rejoin(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        match self.referrals.get_mut(referral_id) {
            Some(mut referral) => {
                referral.rejoin_count += 1;
                referral.last_rejoin_date = Some(now);
                referral.updated_at = now;
                Ok(())
            }
            None => bail!("referral {} not found", referral_id),
        }
    }

    async fn mark_rejoined(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        match self.referrals.get_mut(referral_id) {
            Some(mut referral) => {
                referral.status = ReferralStatus::Rejoined;
                referral.rejoin_count += 1;
                referral.last_rejoin_date = Some(now);
                referral.updated_at = now;
                Ok(())
            }
            None => bail!("referral {} not found", referral_id),
        }
    }

    async fn mark_existing_member(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        match self.referrals.get_mut(referral_id) {
            Some(mut referral) => {
                referral.status = ReferralStatus::ExistingMemberNoReward;
                referral.group_join_verified = true;
                referral.updated_at = now;
                Ok(())
            }
            None => bail!("referral {} not found", referral_id),
        }
    }

    async fn claim_pending(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        match self.referrals.get_mut(referral_id) {
            Some(mut referral) if referral.status == ReferralStatus::PendingGroupJoin => {
                referral.status = ReferralStatus::Verified;
                referral.group_join_verified = true;
                referral.group_join_date = Some(now);
                referral.reward_given = true;
                referral.updated_at = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn release_claim(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        match self.referrals.get_mut(referral_id) {
            Some(mut referral) => {
                referral.status = ReferralStatus::PendingGroupJoin;
                referral.group_join_verified = false;
                referral.group_join_date = None;
                referral.reward_given = false;
                referral.updated_at = now;
                Ok(())
            }
            None => bail!("referral {} not found", referral_id),
        }
    }
}

#[async_trait]
impl RewardLedger for MemoryStore {
    async fn settle(
        &self,
        referrer_id: &str,
        referral_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, anyhow::Error> {
        if self.earnings.iter().any(|e| e.referral_id == referral_id) {
            bail!("earnings entry already exists for referral {}", referral_id);
        }

        match self.users.get_mut(referrer_id) {
            Some(mut referrer) => {
                referrer.balance += amount;
                referrer.total_earnings += amount;
                referrer.total_referrals += 1;
                referrer.updated_at = now;

                let earning = Earning::referral(referrer_id, amount, referral_id, now);
                self.earnings.insert(earning.id.clone(), earning);
                Ok(SettleOutcome::Ok)
            }
            None => Ok(SettleOutcome::ReferrerMissing),
        }
    }

    async fn earnings_for_user(&self, user_id: &str) -> Result<Vec<Earning>, anyhow::Error> {
        let mut earnings: Vec<Earning> = self
            .earnings
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        earnings.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(earnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            username: format!("user_{}", id),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_keeps_created_at_and_refreshes_activity() {
        let store = MemoryStore::new();
        let created = Utc::now();

        store.upsert_profile(&profile("7"), created).await.unwrap();
        let later = created + Duration::minutes(30);
        let updated = store.upsert_profile(&profile("7"), later).await.unwrap();

        assert_eq!(updated.created_at, created);
        assert_eq!(updated.last_active, later);
    }

    #[tokio::test]
    async fn insert_refuses_second_row_for_same_referred() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .insert(&Referral::open("1", "2", "CP1", now))
            .await
            .unwrap();
        let second = store.insert(&Referral::open("3", "2", "CP3", now)).await;

        assert!(second.is_err());
        assert_eq!(store.find_by_referred("2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_pending_succeeds_exactly_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let referral = Referral::open("1", "2", "CP1", now);
        store.insert(&referral).await.unwrap();

        assert!(store.claim_pending(&referral.id, now).await.unwrap());
        assert!(!store.claim_pending(&referral.id, now).await.unwrap());

        let claimed = store.find_by_pair("1", "2").await.unwrap().unwrap();
        assert_eq!(claimed.status, ReferralStatus::Verified);
        assert!(claimed.reward_given);
    }

    #[tokio::test]
    async fn settle_credits_referrer_and_writes_audit_entry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_profile(&profile("1"), now).await.unwrap();

        let outcome = store.settle("1", "ref-1", 2, now).await.unwrap();

        assert_eq!(outcome, SettleOutcome::Ok);
        let referrer = store.get("1").await.unwrap().unwrap();
        assert_eq!(referrer.balance, 2);
        assert_eq!(referrer.total_earnings, 2);
        assert_eq!(referrer.total_referrals, 1);

        let earnings = store.earnings_for_user("1").await.unwrap();
        assert_eq!(earnings.len(), 1);
        assert_eq!(earnings[0].referral_id, "ref-1");
        assert_eq!(earnings[0].kind, "referral");
    }

    #[tokio::test]
    async fn settle_without_referrer_writes_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let outcome = store.settle("ghost", "ref-1", 2, now).await.unwrap();

        assert_eq!(outcome, SettleOutcome::ReferrerMissing);
        assert!(store.earnings_for_user("ghost").await.unwrap().is_empty());
    }
}
