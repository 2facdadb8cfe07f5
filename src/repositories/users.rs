use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::users::{User, UserProfile};
use crate::repositories::UserLedger;

#[derive(Clone)]
pub struct UserRepository {
    conn: PgPool,
}

impl UserRepository {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl UserLedger for UserRepository {
    async fn get(&self, account_id: &str) -> Result<Option<User>, anyhow::Error> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.conn)
            .await?;

        Ok(user)
    }

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<User>, anyhow::Error> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE referral_code = $1")
            .bind(code)
            .fetch_optional(&self.conn)
            .await?;

        Ok(user)
    }

    async fn upsert_profile(
        &self,
        profile: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<User, anyhow::Error> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users
                (id, username, first_name, last_name, balance, total_earnings,
                 total_referrals, referral_code, created_at, updated_at, last_active)
            VALUES ($1, $2, $3, $4, 0, 0, 0, $5, $6, $6, $6)
            ON CONFLICT (id) DO UPDATE
            SET username = EXCLUDED.username,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                last_active = EXCLUDED.last_active,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.username)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(User::referral_code_for(&profile.id))
        .bind(now)
        .fetch_one(&self.conn)
        .await?;

        Ok(user)
    }
}
