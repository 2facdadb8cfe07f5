use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Postgres {
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Storage {
    pub backend: StorageBackend,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Telegram {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub bot_token: String,
    pub group_id: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Rewards {
    #[serde(default = "default_referral_amount")]
    pub referral_amount: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Http {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub storage: Storage,
    pub postgres: Option<Postgres>,
    pub telegram: Telegram,
    #[serde(default)]
    pub rewards: Rewards,
    #[serde(default)]
    pub http: Http,
}

fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_referral_amount() -> i64 {
    2
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for Rewards {
    fn default() -> Self {
        Rewards {
            referral_amount: default_referral_amount(),
        }
    }
}

impl Default for Http {
    fn default() -> Self {
        Http {
            listen: default_listen(),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("CASHPOINTS").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
