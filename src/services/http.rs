use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use super::referrals::ReferralRequest;
use super::users::UserRequest;
use super::ServiceError;
use crate::models::referrals::{OpenOutcome, VerifyOutcome};
use crate::models::users::UserProfile;

#[derive(Clone)]
struct AppState {
    referral_channel: mpsc::Sender<ReferralRequest>,
    user_channel: mpsc::Sender<UserRequest>,
}

#[derive(Deserialize)]
struct StartRequest {
    user_id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    referral_code: Option<String>,
}

#[derive(Deserialize)]
struct VerifyRequest {
    user_id: String,
}

async fn dispatch<T, R>(
    channel: &mpsc::Sender<T>,
    request: T,
    receiver: oneshot::Receiver<Result<R, ServiceError>>,
) -> Result<R, (StatusCode, Json<Value>)> {
    if let Err(e) = channel.send(request).await {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"description": format!("Failed to process request: {}", e)})),
        ));
    }

    match receiver.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(service_error)) => {
            log::error!("request failed: {}", service_error);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"description": "Internal server error."})),
            ))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"description": format!("Failed to receive response: {}", e)})),
        )),
    }
}

/// Rejections are business outcomes the bot renders to the user, not HTTP
/// errors.
fn open_outcome_json(outcome: &OpenOutcome) -> Value {
    match outcome {
        OpenOutcome::Created { referral_id } => {
            json!({"result": "created", "referral_id": referral_id})
        }
        OpenOutcome::Rejected(reason) => json!({"result": "rejected", "reason": reason}),
    }
}

fn verify_outcome_json(outcome: &VerifyOutcome) -> Value {
    match outcome {
        VerifyOutcome::Settled {
            referrer_id,
            amount,
        } => json!({"result": "settled", "referrer_id": referrer_id, "amount": amount}),
        VerifyOutcome::Rejected(reason) => json!({"result": "rejected", "reason": reason}),
        VerifyOutcome::NoOp => json!({"result": "no_op"}),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy", "service": "cashpoints-engine"}))
}

async fn start(State(state): State<AppState>, Json(req): Json<StartRequest>) -> impl IntoResponse {
    let profile = UserProfile {
        id: req.user_id.clone(),
        username: req.username,
        first_name: req.first_name,
        last_name: req.last_name,
    };

    let (user_tx, user_rx) = oneshot::channel();
    let user = match dispatch(
        &state.user_channel,
        UserRequest::RegisterStart {
            profile,
            response: user_tx,
        },
        user_rx,
    )
    .await
    {
        Ok(user) => user,
        Err(response) => return response,
    };

    let referral = match &req.referral_code {
        Some(code) => {
            let (referral_tx, referral_rx) = oneshot::channel();
            match dispatch(
                &state.referral_channel,
                ReferralRequest::Open {
                    referral_code: code.clone(),
                    referred_id: req.user_id.clone(),
                    response: referral_tx,
                },
                referral_rx,
            )
            .await
            {
                Ok(outcome) => Some(open_outcome_json(&outcome)),
                Err(response) => return response,
            }
        }
        None => None,
    };

    let (member_tx, member_rx) = oneshot::channel();
    let is_member = match dispatch(
        &state.user_channel,
        UserRequest::CheckMembership {
            id: req.user_id.clone(),
            response: member_tx,
        },
        member_rx,
    )
    .await
    {
        Ok(is_member) => is_member,
        Err(response) => return response,
    };

    // A referred caller who already joined the group settles (or gets
    // flagged) right away; everyone else goes through /verify.
    let verification = if is_member && referral.is_some() {
        let (verify_tx, verify_rx) = oneshot::channel();
        match dispatch(
            &state.referral_channel,
            ReferralRequest::VerifyAndSettle {
                referred_id: req.user_id.clone(),
                response: verify_tx,
            },
            verify_rx,
        )
        .await
        {
            Ok(outcome) => Some(verify_outcome_json(&outcome)),
            Err(response) => return response,
        }
    } else {
        None
    };

    (
        StatusCode::OK,
        Json(json!({
            "user": user,
            "is_member": is_member,
            "referral": referral,
            "verification": verification,
        })),
    )
}

async fn verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> impl IntoResponse {
    let (verify_tx, verify_rx) = oneshot::channel();
    match dispatch(
        &state.referral_channel,
        ReferralRequest::VerifyAndSettle {
            referred_id: req.user_id,
            response: verify_tx,
        },
        verify_rx,
    )
    .await
    {
        Ok(outcome) => (StatusCode::OK, Json(verify_outcome_json(&outcome))),
        Err(response) => response,
    }
}

async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let (user_tx, user_rx) = oneshot::channel();
    let user = match dispatch(
        &state.user_channel,
        UserRequest::GetUser {
            id: id.clone(),
            response: user_tx,
        },
        user_rx,
    )
    .await
    {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"description": "User not found."})),
            )
        }
        Err(response) => return response,
    };

    let (earnings_tx, earnings_rx) = oneshot::channel();
    match dispatch(
        &state.user_channel,
        UserRequest::GetEarnings {
            id,
            response: earnings_tx,
        },
        earnings_rx,
    )
    .await
    {
        Ok(earnings) => (
            StatusCode::OK,
            Json(json!({"user": user, "earnings": earnings})),
        ),
        Err(response) => response,
    }
}

pub async fn start_http_server(
    listen: &str,
    referral_channel: mpsc::Sender<ReferralRequest>,
    user_channel: mpsc::Sender<UserRequest>,
) -> Result<(), anyhow::Error> {
    let app_state = AppState {
        referral_channel,
        user_channel,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/start", post(start))
        .route("/verify", post(verify))
        .route("/users/{id}", get(get_user))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
