use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::referrals::Referral;
use crate::repositories::ReferralLedger;

#[derive(Clone)]
pub struct ReferralRepository {
    conn: PgPool,
}

impl ReferralRepository {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ReferralLedger for ReferralRepository {
    async fn insert(&self, referral: &Referral) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO referrals
                (id, referrer_id, referred_id, referral_code, status,
                 group_join_verified, group_join_date, reward_given,
                 rejoin_count, last_rejoin_date, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&referral.id)
        .bind(&referral.referrer_id)
        .bind(&referral.referred_id)
        .bind(&referral.referral_code)
        .bind(referral.status)
        .bind(referral.group_join_verified)
        .bind(referral.group_join_date)
        .bind(referral.reward_given)
        .bind(referral.rejoin_count)
        .bind(referral.last_rejoin_date)
        .bind(referral.created_at)
        .bind(referral.updated_at)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    async fn find_by_pair(
        &self,
        referrer_id: &str,
        referred_id: &str,
    ) -> Result<Option<Referral>, anyhow::Error> {
        let referral = sqlx::query_as::<_, Referral>(
            "SELECT * FROM referrals WHERE referrer_id = $1 AND referred_id = $2",
        )
        .bind(referrer_id)
        .bind(referred_id)
        .fetch_optional(&self.conn)
        .await?;

        Ok(referral)
    }

    async fn find_by_referred(&self, referred_id: &str) -> Result<Vec<Referral>, anyhow::Error> {
        let referrals = sqlx::query_as::<_, Referral>(
            "SELECT * FROM referrals WHERE referred_id = $1 ORDER BY created_at DESC",
        )
        .bind(referred_id)
        .fetch_all(&self.conn)
        .await?;

        Ok(referrals)
    }

    async fn find_pending(&self, referred_id: &str) -> Result<Option<Referral>, anyhow::Error> {
        let referral = sqlx::query_as::<_, Referral>(
            "SELECT * FROM referrals WHERE referred_id = $1 AND status = 'pending_group_join'",
        )
        .bind(referred_id)
        .fetch_optional(&self.conn)
        .await?;

        Ok(referral)
    }

    async fn record_rejoin(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            UPDATE referrals
            SET rejoin_count = rejoin_count + 1, last_rejoin_date = $2, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(referral_id)
        .bind(now)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    async fn mark_rejoined(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            UPDATE referrals
            SET status = 'rejoined', rejoin_count = rejoin_count + 1,
                last_rejoin_date = $2, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(referral_id)
        .bind(now)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    async fn mark_existing_member(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            UPDATE referrals
            SET status = 'existing_member_no_reward', group_join_verified = TRUE,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(referral_id)
        .bind(now)
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    async fn claim_pending(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        // Status-scoped update; a concurrent claim leaves zero rows matched.
        let result = sqlx::query(
            r#"
            UPDATE referrals
            SET status = 'verified', group_join_verified = TRUE,
                group_join_date = $2, reward_given = TRUE, updated_at = $2
            WHERE id = $1 AND status = 'pending_group_join'
            "#,
        )
        .bind(referral_id)
        .bind(now)
        .execute(&self.conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            UPDATE referrals
            SET status = 'pending_group_join', group_join_verified = FALSE,
                group_join_date = NULL, reward_given = FALSE, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(referral_id)
        .bind(now)
        .execute(&self.conn)
        .await?;

        Ok(())
    }
}
