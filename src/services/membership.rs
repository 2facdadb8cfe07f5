use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// "Is this account currently a member of the required group?" Answered by
/// the chat platform at call time; results are never cached.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn is_member(&self, user_id: &str) -> Result<bool, anyhow::Error>;
}

pub struct TelegramMembershipOracle {
    client: reqwest::Client,
    api_url: String,
    bot_token: String,
    group_id: i64,
}

impl TelegramMembershipOracle {
    pub fn new(api_url: &str, bot_token: &str, group_id: i64) -> Self {
        TelegramMembershipOracle {
            client: reqwest::Client::new(),
            api_url: api_url.to_string(),
            bot_token: bot_token.to_string(),
            group_id,
        }
    }
}

#[derive(Deserialize)]
struct ChatMemberResponse {
    ok: bool,
    #[serde(default)]
    result: Option<ChatMember>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct ChatMember {
    status: String,
}

#[async_trait]
impl MembershipOracle for TelegramMembershipOracle {
    async fn is_member(&self, user_id: &str) -> Result<bool, anyhow::Error> {
        let user_id: i64 = user_id.parse()?;
        let url = format!("{}/bot{}/getChatMember", self.api_url, self.bot_token);

        let response = self
            .client
            .post(&url)
            .json(&json!({ "chat_id": self.group_id, "user_id": user_id }))
            .send()
            .await?
            .json::<ChatMemberResponse>()
            .await?;

        if !response.ok {
            anyhow::bail!(
                "getChatMember failed: {}",
                response.description.unwrap_or_default()
            );
        }

        let status = response.result.map(|m| m.status).unwrap_or_default();
        Ok(matches!(
            status.as_str(),
            "member" | "administrator" | "creator"
        ))
    }
}
