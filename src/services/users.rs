use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::membership::MembershipOracle;
use super::{RequestHandler, Service, ServiceError};
use crate::models::earnings::Earning;
use crate::models::users::{User, UserProfile};
use crate::repositories::{RewardLedger, UserLedger};
use crate::utils::Clock;

pub enum UserRequest {
    RegisterStart {
        profile: UserProfile,
        response: oneshot::Sender<Result<User, ServiceError>>,
    },
    GetUser {
        id: String,
        response: oneshot::Sender<Result<Option<User>, ServiceError>>,
    },
    GetEarnings {
        id: String,
        response: oneshot::Sender<Result<Vec<Earning>, ServiceError>>,
    },
    CheckMembership {
        id: String,
        response: oneshot::Sender<Result<bool, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct UserRequestHandler {
    users: Arc<dyn UserLedger>,
    rewards: Arc<dyn RewardLedger>,
    membership: Arc<dyn MembershipOracle>,
    clock: Arc<dyn Clock>,
}

impl UserRequestHandler {
    pub fn new(
        users: Arc<dyn UserLedger>,
        rewards: Arc<dyn RewardLedger>,
        membership: Arc<dyn MembershipOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        UserRequestHandler {
            users,
            rewards,
            membership,
            clock,
        }
    }

    async fn register_start(&self, profile: &UserProfile) -> Result<User, ServiceError> {
        if profile.id.is_empty() {
            return Err(ServiceError::Internal("empty account id".to_string()));
        }

        self.users
            .upsert_profile(profile, self.clock.now())
            .await
            .map_err(|e| ServiceError::Database(e.to_string()))
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>, ServiceError> {
        self.users
            .get(id)
            .await
            .map_err(|e| ServiceError::Database(e.to_string()))
    }

    async fn get_earnings(&self, id: &str) -> Result<Vec<Earning>, ServiceError> {
        self.rewards
            .earnings_for_user(id)
            .await
            .map_err(|e| ServiceError::Database(e.to_string()))
    }

    /// Failures read as "not a member", same as the engine's own boundary.
    async fn check_membership(&self, id: &str) -> bool {
        match self.membership.is_member(id).await {
            Ok(is_member) => is_member,
            Err(e) => {
                log::warn!("membership check failed for {}: {}", id, e);
                false
            }
        }
    }
}

#[async_trait]
impl RequestHandler<UserRequest> for UserRequestHandler {
    async fn handle_request(&self, request: UserRequest) {
        match request {
            UserRequest::RegisterStart { profile, response } => {
                let user = self.register_start(&profile).await;
                let _ = response.send(user);
            }
            UserRequest::GetUser { id, response } => {
                let user = self.get_user(&id).await;
                let _ = response.send(user);
            }
            UserRequest::GetEarnings { id, response } => {
                let earnings = self.get_earnings(&id).await;
                let _ = response.send(earnings);
            }
            UserRequest::CheckMembership { id, response } => {
                let is_member = self.check_membership(&id).await;
                let _ = response.send(Ok(is_member));
            }
        }
    }
}

pub struct UserService;

impl UserService {
    pub fn new() -> Self {
        UserService {}
    }
}

#[async_trait]
impl Service<UserRequest, UserRequestHandler> for UserService {}
