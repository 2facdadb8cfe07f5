use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub balance: i64,
    pub total_earnings: i64,
    pub total_referrals: i64,
    pub referral_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl User {
    /// Referral codes are derived from the account id, never chosen.
    pub fn referral_code_for(account_id: &str) -> String {
        format!("CP{}", account_id)
    }

    pub fn new(profile: &UserProfile, now: DateTime<Utc>) -> Self {
        User {
            id: profile.id.clone(),
            username: profile.username.clone(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            balance: 0,
            total_earnings: 0,
            total_referrals: 0,
            referral_code: Self::referral_code_for(&profile.id),
            created_at: now,
            updated_at: now,
            last_active: now,
        }
    }
}

/// Display fields supplied by the bot front-end on a start event.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_code_derives_from_account_id() {
        assert_eq!(User::referral_code_for("123456789"), "CP123456789");
    }

    #[test]
    fn new_user_starts_with_zeroed_counters_and_derived_code() {
        let profile = UserProfile {
            id: "42".to_string(),
            username: "someone".to_string(),
            ..Default::default()
        };
        let now = Utc::now();
        let user = User::new(&profile, now);

        assert_eq!(user.balance, 0);
        assert_eq!(user.total_earnings, 0);
        assert_eq!(user.total_referrals, 0);
        assert_eq!(user.referral_code, "CP42");
        assert_eq!(user.created_at, now);
    }
}
