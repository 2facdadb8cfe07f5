use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;

use crate::repositories::memory::MemoryStore;
use crate::repositories::referrals::ReferralRepository;
use crate::repositories::rewards::RewardRepository;
use crate::repositories::users::UserRepository;
use crate::repositories::{ReferralLedger, RewardLedger, UserLedger};
use crate::settings::{Settings, StorageBackend};
use crate::utils::SystemClock;

mod http;
mod membership;
mod referrals;
mod users;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Engine error: {0}")]
    Engine(String),
    #[error("Communication error: {0} - {1}")]
    Communication(String, String),
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

pub async fn start_services(settings: Settings) -> Result<(), anyhow::Error> {
    let (user_ledger, referral_ledger, reward_ledger): (
        Arc<dyn UserLedger>,
        Arc<dyn ReferralLedger>,
        Arc<dyn RewardLedger>,
    ) = match settings.storage.backend {
        StorageBackend::Postgres => {
            let postgres = settings
                .postgres
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("postgres backend selected but not configured"))?;
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&postgres.url)
                .await?;
            sqlx::migrate!("./migrations").run(&pool).await?;

            (
                Arc::new(UserRepository::new(pool.clone())),
                Arc::new(ReferralRepository::new(pool.clone())),
                Arc::new(RewardRepository::new(pool)),
            )
        }
        StorageBackend::Memory => {
            log::warn!("Using in-memory storage backend; nothing is persisted.");
            let store = Arc::new(MemoryStore::new());

            (store.clone(), store.clone(), store)
        }
    };

    let oracle = Arc::new(membership::TelegramMembershipOracle::new(
        &settings.telegram.api_url,
        &settings.telegram.bot_token,
        settings.telegram.group_id,
    ));
    let clock = Arc::new(SystemClock);

    let engine = Arc::new(referrals::ReferralEngine::new(
        user_ledger.clone(),
        referral_ledger,
        reward_ledger.clone(),
        oracle.clone(),
        clock.clone(),
        settings.rewards.referral_amount,
    ));

    let (referral_tx, mut referral_rx) = mpsc::channel(512);
    let (user_tx, mut user_rx) = mpsc::channel(512);

    log::info!("Starting referral service.");
    let mut referral_service = referrals::ReferralService::new();
    let referral_users = user_ledger.clone();
    let referral_engine = engine.clone();
    tokio::spawn(async move {
        referral_service
            .run(
                referrals::ReferralRequestHandler::new(referral_engine, referral_users),
                &mut referral_rx,
            )
            .await;
    });

    log::info!("Starting user service.");
    let mut user_service = users::UserService::new();
    tokio::spawn(async move {
        user_service
            .run(
                users::UserRequestHandler::new(user_ledger, reward_ledger, oracle, clock),
                &mut user_rx,
            )
            .await;
    });

    log::info!("Starting HTTP server.");
    http::start_http_server(&settings.http.listen, referral_tx, user_tx).await
}
