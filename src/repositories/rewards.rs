use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::earnings::{Earning, SettleOutcome};
use crate::repositories::RewardLedger;

#[derive(Clone)]
pub struct RewardRepository {
    conn: PgPool,
}

impl RewardRepository {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RewardLedger for RewardRepository {
    async fn settle(
        &self,
        referrer_id: &str,
        referral_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, anyhow::Error> {
        let mut tx = self.conn.begin().await?;

        let credited = sqlx::query(
            r#"
            UPDATE users
            SET balance = balance + $1, total_earnings = total_earnings + $1,
                total_referrals = total_referrals + 1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(referrer_id)
        .execute(&mut *tx)
        .await?;

        if credited.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(SettleOutcome::ReferrerMissing);
        }

        let earning = Earning::referral(referrer_id, amount, referral_id, now);
        sqlx::query(
            r#"
            INSERT INTO earnings (id, user_id, amount, kind, referral_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&earning.id)
        .bind(&earning.user_id)
        .bind(earning.amount)
        .bind(&earning.kind)
        .bind(&earning.referral_id)
        .bind(earning.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SettleOutcome::Ok)
    }

    async fn earnings_for_user(&self, user_id: &str) -> Result<Vec<Earning>, anyhow::Error> {
        let earnings = sqlx::query_as::<_, Earning>(
            "SELECT * FROM earnings WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.conn)
        .await?;

        Ok(earnings)
    }
}
