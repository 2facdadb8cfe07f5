use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::oneshot;

use super::membership::MembershipOracle;
use super::{RequestHandler, Service, ServiceError};
use crate::models::earnings::SettleOutcome;
use crate::models::referrals::{
    OpenOutcome, Referral, ReferralStatus, RejectReason, VerifyOutcome, VerifyRejection,
};
use crate::models::users::User;
use crate::repositories::{ReferralLedger, RewardLedger, UserLedger};
use crate::utils::Clock;

/// A genuinely referred candidate is expected to verify within minutes;
/// referral trails or accounts older than this predate the referral attempt.
fn fresh_candidate_window() -> Duration {
    Duration::hours(1)
}

fn abusive_referrer_age() -> Duration {
    Duration::hours(24)
}

fn suspicious_referrer_age() -> Duration {
    Duration::days(7)
}

fn suspicious_candidate_age() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("empty account id")]
    EmptyAccountId,
    #[error("referral code {code} does not derive from referrer {referrer_id}")]
    CodeMismatch { referrer_id: String, code: String },
    #[error("settlement failed for referral {referral_id}: {reason}")]
    SettlementFailed { referral_id: String, reason: String },
    #[error(transparent)]
    Ledger(#[from] anyhow::Error),
}

/// The referral validation and anti-abuse state machine. Decides, for every
/// (referrer, candidate) pair and every membership-verification event,
/// whether a referral row is created, flagged, or settled — and settles at
/// most once.
pub struct ReferralEngine {
    users: Arc<dyn UserLedger>,
    referrals: Arc<dyn ReferralLedger>,
    rewards: Arc<dyn RewardLedger>,
    membership: Arc<dyn MembershipOracle>,
    clock: Arc<dyn Clock>,
    reward_amount: i64,
}

impl ReferralEngine {
    pub fn new(
        users: Arc<dyn UserLedger>,
        referrals: Arc<dyn ReferralLedger>,
        rewards: Arc<dyn RewardLedger>,
        membership: Arc<dyn MembershipOracle>,
        clock: Arc<dyn Clock>,
        reward_amount: i64,
    ) -> Self {
        ReferralEngine {
            users,
            referrals,
            rewards,
            membership,
            clock,
            reward_amount,
        }
    }

    /// Opens a referral for (referrer, candidate), running the guard chain
    /// in order and short-circuiting on the first failure. Idempotent: a
    /// repeat call for the same pair lands in the duplicate guard and bumps
    /// the rejoin counter instead of creating a second row.
    pub async fn open(
        &self,
        referrer_id: &str,
        referred_id: &str,
        referral_code: &str,
    ) -> Result<OpenOutcome, EngineError> {
        if referrer_id.is_empty() || referred_id.is_empty() {
            return Err(EngineError::EmptyAccountId);
        }
        if referral_code != User::referral_code_for(referrer_id) {
            log::error!(
                "referral code {} does not derive from referrer {}",
                referral_code,
                referrer_id
            );
            return Err(EngineError::CodeMismatch {
                referrer_id: referrer_id.to_string(),
                code: referral_code.to_string(),
            });
        }

        let now = self.clock.now();

        if referrer_id == referred_id {
            log::warn!("user {} tried to use their own referral code", referrer_id);
            return Ok(OpenOutcome::Rejected(RejectReason::SelfReferral));
        }

        if let Some(existing) = self.referrals.find_by_pair(referrer_id, referred_id).await? {
            self.referrals.record_rejoin(&existing.id, now).await?;
            log::info!(
                "duplicate referral of {} by {}, rejoin count now {}",
                referred_id,
                referrer_id,
                existing.rejoin_count + 1
            );
            return Ok(OpenOutcome::Rejected(RejectReason::DuplicatePair));
        }

        if let Some(prior) = self
            .referrals
            .find_by_referred(referred_id)
            .await?
            .into_iter()
            .next()
        {
            log::warn!(
                "{} was already referred by {}, ignoring referral from {}",
                referred_id,
                prior.referrer_id,
                referrer_id
            );
            return Ok(OpenOutcome::Rejected(RejectReason::AlreadyReferredByOther));
        }

        if self.is_pre_existing_member(referred_id, now).await? {
            return Ok(OpenOutcome::Rejected(RejectReason::PreExistingMember));
        }

        if self.is_abusive_pattern(referrer_id, referred_id, now).await? {
            return Ok(OpenOutcome::Rejected(RejectReason::ReferrerAbusePattern));
        }

        if let Some(candidate) = self.users.get(referred_id).await? {
            if now - candidate.created_at > fresh_candidate_window() {
                return Ok(OpenOutcome::Rejected(RejectReason::StaleCandidateAccount));
            }
        }

        let referral = Referral::open(referrer_id, referred_id, referral_code, now);
        let referral_id = referral.id.clone();
        self.referrals.insert(&referral).await?;
        log::info!("opened referral {} -> {}", referrer_id, referred_id);

        Ok(OpenOutcome::Created { referral_id })
    }

    /// Handles a membership-verification event for the candidate. Settles
    /// the pending referral at most once; the conditional claim on the
    /// referral row is the double-payment defense.
    pub async fn verify_and_settle(&self, referred_id: &str) -> Result<VerifyOutcome, EngineError> {
        let now = self.clock.now();

        if !self.check_membership(referred_id).await {
            return Ok(VerifyOutcome::NoOp);
        }

        if self.detect_rejoin(referred_id, now).await? {
            return Ok(VerifyOutcome::Rejected(VerifyRejection::RejoinDetected));
        }

        let pending = match self.referrals.find_pending(referred_id).await? {
            Some(pending) => pending,
            None => return Ok(VerifyOutcome::NoOp),
        };

        // Defense in depth: the open-time guard ran against an older ledger.
        if self.is_pre_existing_member(referred_id, now).await? {
            self.referrals.mark_existing_member(&pending.id, now).await?;
            return Ok(VerifyOutcome::Rejected(VerifyRejection::ExistingMember));
        }

        if !self.referrals.claim_pending(&pending.id, now).await? {
            return Ok(VerifyOutcome::NoOp);
        }

        match self
            .rewards
            .settle(&pending.referrer_id, &pending.id, self.reward_amount, now)
            .await
        {
            Ok(SettleOutcome::Ok) => {
                log::info!(
                    "rewarded {} to referrer {} for referral {}",
                    self.reward_amount,
                    pending.referrer_id,
                    pending.id
                );
                Ok(VerifyOutcome::Settled {
                    referrer_id: pending.referrer_id,
                    amount: self.reward_amount,
                })
            }
            Ok(SettleOutcome::ReferrerMissing) => {
                self.rollback_claim(&pending.id, now).await;
                Err(EngineError::SettlementFailed {
                    referral_id: pending.id,
                    reason: format!("referrer {} not found", pending.referrer_id),
                })
            }
            Err(e) => {
                self.rollback_claim(&pending.id, now).await;
                Err(EngineError::SettlementFailed {
                    referral_id: pending.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Was the candidate already in the group before this referral attempt?
    /// A rejoin trail, a referral older than the fresh-candidate window, or
    /// an account older than that window all mark a returning member.
    async fn is_pre_existing_member(
        &self,
        referred_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if !self.check_membership(referred_id).await {
            return Ok(false);
        }

        let history = self.referrals.find_by_referred(referred_id).await?;
        if history.iter().any(|r| r.rejoin_count > 0) {
            return Ok(true);
        }
        if history
            .iter()
            .any(|r| now - r.created_at > fresh_candidate_window())
        {
            return Ok(true);
        }
        if let Some(user) = self.users.get(referred_id).await? {
            if now - user.created_at > fresh_candidate_window() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// A long-tenured referrer "discovering" a brand-new account is the
    /// strong abuse signal; an old referrer with a same-day candidate is
    /// only logged.
    async fn is_abusive_pattern(
        &self,
        referrer_id: &str,
        referred_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let referrer = self
            .users
            .get(referrer_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("referrer {} has no ledger record", referrer_id))?;
        let referrer_age = now - referrer.created_at;
        let candidate_age = match self.users.get(referred_id).await? {
            Some(candidate) => now - candidate.created_at,
            None => Duration::zero(),
        };

        if referrer_age > abusive_referrer_age() && candidate_age < fresh_candidate_window() {
            log::warn!(
                "abusive referral pattern: referrer {} is {}h old, candidate {} is {}m old",
                referrer_id,
                referrer_age.num_hours(),
                referred_id,
                candidate_age.num_minutes()
            );
            return Ok(true);
        }

        if referrer_age > suspicious_referrer_age() && candidate_age < suspicious_candidate_age() {
            log::warn!(
                "suspicious referral pattern (not blocked): referrer {} is {}d old, candidate {} is {}h old",
                referrer_id,
                referrer_age.num_days(),
                referred_id,
                candidate_age.num_hours()
            );
        }

        Ok(false)
    }

    /// Rejoin detection: a pre-existing member whose latest referral was
    /// already rewarded is farming; the row is flipped to `rejoined` and the
    /// counter bumped. History is never deleted.
    async fn detect_rejoin(
        &self,
        referred_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if !self.is_pre_existing_member(referred_id, now).await? {
            return Ok(false);
        }

        let history = self.referrals.find_by_referred(referred_id).await?;
        match history.first() {
            Some(latest) if latest.status == ReferralStatus::Verified => {
                self.referrals.mark_rejoined(&latest.id, now).await?;
                log::info!(
                    "rejoin detected for {}; referral {} marked rejoined",
                    referred_id,
                    latest.id
                );
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                log::info!("rejoin detected for {} with no referral trail", referred_id);
                Ok(true)
            }
        }
    }

    /// Oracle failures downgrade to "not a member" — the conservative
    /// outcome for every caller.
    async fn check_membership(&self, user_id: &str) -> bool {
        match self.membership.is_member(user_id).await {
            Ok(is_member) => is_member,
            Err(e) => {
                log::warn!(
                    "membership check failed for {}: {}; treating as not a member",
                    user_id,
                    e
                );
                false
            }
        }
    }

    async fn rollback_claim(&self, referral_id: &str, now: DateTime<Utc>) {
        if let Err(e) = self.referrals.release_claim(referral_id, now).await {
            log::error!(
                "failed to roll back claim on referral {}; manual reconciliation required: {}",
                referral_id,
                e
            );
        }
    }
}

pub enum ReferralRequest {
    Open {
        referral_code: String,
        referred_id: String,
        response: oneshot::Sender<Result<OpenOutcome, ServiceError>>,
    },
    VerifyAndSettle {
        referred_id: String,
        response: oneshot::Sender<Result<VerifyOutcome, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct ReferralRequestHandler {
    engine: Arc<ReferralEngine>,
    users: Arc<dyn UserLedger>,
}

impl ReferralRequestHandler {
    pub fn new(engine: Arc<ReferralEngine>, users: Arc<dyn UserLedger>) -> Self {
        ReferralRequestHandler { engine, users }
    }

    /// Start events carry a code, not a referrer id; the code is resolved
    /// against the user ledger before the guard chain runs.
    async fn open_with_code(
        &self,
        referral_code: &str,
        referred_id: &str,
    ) -> Result<OpenOutcome, ServiceError> {
        let referrer = self
            .users
            .find_by_referral_code(referral_code)
            .await
            .map_err(|e| ServiceError::Database(e.to_string()))?;

        match referrer {
            None => {
                log::warn!("no referrer found for code {}", referral_code);
                Ok(OpenOutcome::Rejected(RejectReason::UnknownReferralCode))
            }
            Some(referrer) => self
                .engine
                .open(&referrer.id, referred_id, referral_code)
                .await
                .map_err(service_error),
        }
    }

    async fn verify_and_settle(&self, referred_id: &str) -> Result<VerifyOutcome, ServiceError> {
        self.engine
            .verify_and_settle(referred_id)
            .await
            .map_err(service_error)
    }
}

fn service_error(e: EngineError) -> ServiceError {
    match e {
        EngineError::Ledger(e) => ServiceError::Database(e.to_string()),
        other => ServiceError::Engine(other.to_string()),
    }
}

#[async_trait]
impl RequestHandler<ReferralRequest> for ReferralRequestHandler {
    async fn handle_request(&self, request: ReferralRequest) {
        match request {
            ReferralRequest::Open {
                referral_code,
                referred_id,
                response,
            } => {
                let outcome = self.open_with_code(&referral_code, &referred_id).await;
                let _ = response.send(outcome);
            }
            ReferralRequest::VerifyAndSettle {
                referred_id,
                response,
            } => {
                let outcome = self.verify_and_settle(&referred_id).await;
                let _ = response.send(outcome);
            }
        }
    }
}

pub struct ReferralService;

impl ReferralService {
    pub fn new() -> Self {
        ReferralService {}
    }
}

#[async_trait]
impl Service<ReferralRequest, ReferralRequestHandler> for ReferralService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::users::UserProfile;
    use crate::repositories::memory::MemoryStore;
    use crate::utils::FixedClock;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const REWARD: i64 = 2;

    #[derive(Default)]
    struct ScriptedOracle {
        members: Mutex<HashSet<String>>,
        failing: AtomicBool,
    }

    impl ScriptedOracle {
        fn join(&self, user_id: &str) {
            self.members.lock().unwrap().insert(user_id.to_string());
        }

        fn leave(&self, user_id: &str) {
            self.members.lock().unwrap().remove(user_id);
        }

        fn fail(&self) {
            self.failing.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MembershipOracle for ScriptedOracle {
        async fn is_member(&self, user_id: &str) -> Result<bool, anyhow::Error> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("oracle unavailable");
            }
            Ok(self.members.lock().unwrap().contains(user_id))
        }
    }

    struct Harness {
        engine: ReferralEngine,
        store: Arc<MemoryStore>,
        oracle: Arc<ScriptedOracle>,
        clock: Arc<FixedClock>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let oracle = Arc::new(ScriptedOracle::default());
            let clock = Arc::new(FixedClock::at(
                Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            ));
            let engine = ReferralEngine::new(
                store.clone(),
                store.clone(),
                store.clone(),
                oracle.clone(),
                clock.clone(),
                REWARD,
            );

            Harness {
                engine,
                store,
                oracle,
                clock,
            }
        }

        async fn register(&self, id: &str) {
            let profile = UserProfile {
                id: id.to_string(),
                ..Default::default()
            };
            self.store
                .upsert_profile(&profile, self.clock.now())
                .await
                .unwrap();
        }

        async fn user(&self, id: &str) -> crate::models::users::User {
            UserLedger::get(self.store.as_ref(), id).await.unwrap().unwrap()
        }

        async fn referral_of(&self, referred_id: &str) -> Referral {
            self.store
                .find_by_referred(referred_id)
                .await
                .unwrap()
                .into_iter()
                .next()
                .unwrap()
        }
    }

    fn code(id: &str) -> String {
        User::referral_code_for(id)
    }

    #[tokio::test]
    async fn self_referral_rejected_without_creating_a_row() {
        let h = Harness::new();
        h.register("1").await;

        let outcome = h.engine.open("1", "1", &code("1")).await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::Rejected(RejectReason::SelfReferral)
        );
        assert!(h.store.find_by_referred("1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_creates_a_pending_referral() {
        let h = Harness::new();
        h.register("1").await;
        h.register("2").await;

        let outcome = h.engine.open("1", "2", &code("1")).await.unwrap();

        assert!(matches!(outcome, OpenOutcome::Created { .. }));
        let referral = h.referral_of("2").await;
        assert_eq!(referral.status, ReferralStatus::PendingGroupJoin);
        assert_eq!(referral.referrer_id, "1");
        assert!(!referral.reward_given);
    }

    #[tokio::test]
    async fn repeated_open_is_idempotent_and_bumps_rejoin_count() {
        let h = Harness::new();
        h.register("1").await;
        h.register("2").await;

        h.engine.open("1", "2", &code("1")).await.unwrap();
        let second = h.engine.open("1", "2", &code("1")).await.unwrap();

        assert_eq!(second, OpenOutcome::Rejected(RejectReason::DuplicatePair));
        let history = h.store.find_by_referred("2").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].rejoin_count, 1);
        assert!(history[0].last_rejoin_date.is_some());
    }

    #[tokio::test]
    async fn second_referrer_earns_nothing_ever() {
        let h = Harness::new();
        h.register("1").await;
        h.register("3").await;
        h.register("2").await;

        h.engine.open("1", "2", &code("1")).await.unwrap();
        let other = h.engine.open("3", "2", &code("3")).await.unwrap();

        assert_eq!(
            other,
            OpenOutcome::Rejected(RejectReason::AlreadyReferredByOther)
        );
        let history = h.store.find_by_referred("2").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].referrer_id, "1");
    }

    #[tokio::test]
    async fn old_referrer_with_brand_new_candidate_is_abusive() {
        let h = Harness::new();
        h.register("1").await;
        h.clock.advance(Duration::days(10));
        h.register("2").await;
        h.clock.advance(Duration::minutes(10));

        let outcome = h.engine.open("1", "2", &code("1")).await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::Rejected(RejectReason::ReferrerAbusePattern)
        );
        assert!(h.store.find_by_referred("2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn day_old_referrer_with_fresh_candidate_is_allowed() {
        let h = Harness::new();
        h.register("1").await;
        h.clock.advance(Duration::hours(20));
        h.register("2").await;

        let outcome = h.engine.open("1", "2", &code("1")).await.unwrap();

        assert!(matches!(outcome, OpenOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn suspicious_tier_logs_but_rejects_as_stale_not_abuse() {
        // Referrer past the week mark, candidate past the fresh window but
        // inside the same-day window: the abuse guard lets it through and
        // the stale-candidate guard is the one that fires.
        let h = Harness::new();
        h.register("1").await;
        h.clock.advance(Duration::days(8));
        h.register("2").await;
        h.clock.advance(Duration::hours(2));

        let outcome = h.engine.open("1", "2", &code("1")).await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::Rejected(RejectReason::StaleCandidateAccount)
        );
    }

    #[tokio::test]
    async fn stale_candidate_account_rejected() {
        let h = Harness::new();
        h.register("2").await;
        h.clock.advance(Duration::hours(2));
        h.register("1").await;

        let outcome = h.engine.open("1", "2", &code("1")).await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::Rejected(RejectReason::StaleCandidateAccount)
        );
    }

    #[tokio::test]
    async fn pre_existing_member_rejected_before_staleness_applies() {
        let h = Harness::new();
        h.register("1").await;
        h.register("2").await;
        h.oracle.join("2");
        h.clock.advance(Duration::hours(2));

        let outcome = h.engine.open("1", "2", &code("1")).await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::Rejected(RejectReason::PreExistingMember)
        );
    }

    #[tokio::test]
    async fn mismatched_code_is_an_invariant_violation() {
        let h = Harness::new();
        h.register("1").await;
        h.register("2").await;

        let result = h.engine.open("1", "2", "CP999").await;

        assert!(matches!(result, Err(EngineError::CodeMismatch { .. })));
    }

    #[tokio::test]
    async fn verify_before_joining_is_a_no_op() {
        let h = Harness::new();
        h.register("1").await;
        h.register("2").await;
        h.engine.open("1", "2", &code("1")).await.unwrap();

        let outcome = h.engine.verify_and_settle("2").await.unwrap();

        assert_eq!(outcome, VerifyOutcome::NoOp);
        assert_eq!(h.referral_of("2").await.status, ReferralStatus::PendingGroupJoin);
    }

    #[tokio::test]
    async fn verify_settles_exactly_once() {
        let h = Harness::new();
        h.register("1").await;
        h.register("2").await;
        h.engine.open("1", "2", &code("1")).await.unwrap();
        h.oracle.join("2");

        let settled = h.engine.verify_and_settle("2").await.unwrap();
        assert_eq!(
            settled,
            VerifyOutcome::Settled {
                referrer_id: "1".to_string(),
                amount: REWARD
            }
        );

        let referrer = h.user("1").await;
        assert_eq!(referrer.balance, REWARD);
        assert_eq!(referrer.total_earnings, REWARD);
        assert_eq!(referrer.total_referrals, 1);

        let referral = h.referral_of("2").await;
        assert_eq!(referral.status, ReferralStatus::Verified);
        assert!(referral.group_join_verified);
        assert!(referral.reward_given);

        let earnings = h.store.earnings_for_user("1").await.unwrap();
        assert_eq!(earnings.len(), 1);
        assert_eq!(earnings[0].referral_id, referral.id);
        assert_eq!(earnings[0].amount, REWARD);

        // Second event finds no pending row and pays nothing more.
        let again = h.engine.verify_and_settle("2").await.unwrap();
        assert_eq!(again, VerifyOutcome::NoOp);
        assert_eq!(h.user("1").await.balance, REWARD);
        assert_eq!(h.store.earnings_for_user("1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejoin_after_reward_never_pays_again() {
        let h = Harness::new();
        h.register("1").await;
        h.register("2").await;
        h.engine.open("1", "2", &code("1")).await.unwrap();
        h.oracle.join("2");
        h.engine.verify_and_settle("2").await.unwrap();

        h.clock.advance(Duration::hours(2));
        h.oracle.leave("2");
        h.oracle.join("2");

        let outcome = h.engine.verify_and_settle("2").await.unwrap();

        assert_eq!(
            outcome,
            VerifyOutcome::Rejected(VerifyRejection::RejoinDetected)
        );
        let referral = h.referral_of("2").await;
        assert_eq!(referral.status, ReferralStatus::Rejoined);
        assert_eq!(referral.rejoin_count, 1);
        assert_eq!(h.user("1").await.balance, REWARD);
        assert_eq!(h.store.earnings_for_user("1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_verification_transitions_to_existing_member_no_reward() {
        let h = Harness::new();
        h.register("1").await;
        h.register("2").await;
        h.engine.open("1", "2", &code("1")).await.unwrap();

        // The pending referral ages past the fresh window before the
        // candidate ever verifies.
        h.clock.advance(Duration::hours(2));
        h.oracle.join("2");

        let outcome = h.engine.verify_and_settle("2").await.unwrap();

        assert_eq!(
            outcome,
            VerifyOutcome::Rejected(VerifyRejection::ExistingMember)
        );
        let referral = h.referral_of("2").await;
        assert_eq!(referral.status, ReferralStatus::ExistingMemberNoReward);
        assert!(referral.group_join_verified);
        assert!(!referral.reward_given);
        assert_eq!(h.user("1").await.balance, 0);
    }

    #[tokio::test]
    async fn settlement_failure_rolls_the_claim_back() {
        let h = Harness::new();
        h.register("2").await;
        // Referral whose referrer has no ledger record; settlement must fail
        // and the row must return to pending.
        let referral = Referral::open("ghost", "2", "CPghost", h.clock.now());
        h.store.insert(&referral).await.unwrap();
        h.oracle.join("2");

        let result = h.engine.verify_and_settle("2").await;

        assert!(matches!(
            result,
            Err(EngineError::SettlementFailed { .. })
        ));
        let rolled_back = h.referral_of("2").await;
        assert_eq!(rolled_back.status, ReferralStatus::PendingGroupJoin);
        assert!(!rolled_back.reward_given);
        assert!(h.store.earnings_for_user("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oracle_failure_downgrades_to_not_a_member() {
        let h = Harness::new();
        h.register("1").await;
        h.register("2").await;
        h.engine.open("1", "2", &code("1")).await.unwrap();
        h.oracle.join("2");
        h.oracle.fail();

        let outcome = h.engine.verify_and_settle("2").await.unwrap();

        assert_eq!(outcome, VerifyOutcome::NoOp);
        assert_eq!(h.user("1").await.balance, 0);
    }

    #[tokio::test]
    async fn unknown_code_rejected_at_resolution() {
        let h = Harness::new();
        let engine = Arc::new(ReferralEngine::new(
            h.store.clone(),
            h.store.clone(),
            h.store.clone(),
            h.oracle.clone(),
            h.clock.clone(),
            REWARD,
        ));
        let handler = ReferralRequestHandler::new(engine, h.store.clone());

        let outcome = handler.open_with_code("CP404", "2").await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::Rejected(RejectReason::UnknownReferralCode)
        );
    }
}
