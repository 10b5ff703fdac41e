//! HTTP surface
//!
//! JSON endpoints over the engines. The caller identity comes from the
//! `x-actor-id` header, which the gateway in front of this service fills
//! in after verifying the identity token; a missing header fails as
//! unauthenticated inside the engines.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::auth::StoreAuth;
use crate::bounty::{
    BountyEngine, CreateBountyRequest, CreateBountyResponse, SubmitClaimRequest,
    SubmitClaimResponse,
};
use crate::challenge::{
    AcceptChallengeResponse, ChallengeEngine, ClipSubmission, CreateChallengeResponse,
};
use crate::error::{EngineError, EngineResult};
use crate::events::{DocUpdate, ObserverHub};
use crate::model::{paths, Role};
use crate::ratelimit::{ActionClass, RateLimiter, RateLimitStatus};
use crate::reputation::ReputationService;
use crate::store::DocumentStore;
use crate::video::{FinalizeEvent, PipelineOutcome, VideoPipeline};

pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub challenges: Arc<ChallengeEngine>,
    pub bounties: Arc<BountyEngine>,
    pub pipeline: Arc<VideoPipeline>,
    pub limiter: Arc<RateLimiter>,
    pub reputation: Arc<ReputationService>,
    pub auth: Arc<StoreAuth>,
    pub hub: Arc<ObserverHub>,
    pub started_at: std::time::Instant,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            EngineError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            EngineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            EngineError::FailedPrecondition(_) => StatusCode::CONFLICT,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::DeadlineExceeded(_) => StatusCode::GONE,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {}", self);
        }
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

fn actor_of(headers: &HeaderMap) -> String {
    headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/challenges", post(create_challenge_handler))
        .route("/challenges/:id/accept", post(accept_challenge_handler))
        .route("/challenges/:id/resubmit", post(resubmit_clip_handler))
        .route("/challenges/:id/votes", post(challenge_vote_handler))
        .route("/challenges/:id/settle", post(settle_challenge_handler))
        .route("/bounties", post(create_bounty_handler))
        .route("/bounties/:id/cancel", post(cancel_bounty_handler))
        .route("/bounties/:id/claims", post(submit_claim_handler))
        .route(
            "/bounties/:id/claims/:claim_id/withdraw",
            post(withdraw_claim_handler),
        )
        .route(
            "/bounties/:id/claims/:claim_id/filmer-confirmation",
            post(filmer_confirmation_handler),
        )
        .route(
            "/bounties/:id/claims/:claim_id/votes",
            post(claim_vote_handler),
        )
        .route(
            "/bounties/:id/claims/:claim_id/decision",
            post(creator_decision_handler),
        )
        .route(
            "/bounties/:id/claims/:claim_id/payout",
            post(payout_handler),
        )
        .route("/events/finalize", post(finalize_event_handler))
        .route("/rate-limits/:action", get(rate_limit_status_handler))
        .route("/users/:id/roles", post(grant_role_handler))
        .route("/users/:id/abuse-penalty", post(abuse_penalty_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// HEALTH
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    uptime_secs: u64,
    version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// CHALLENGES
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateChallengeBody {
    opponent_id: String,
    clip: ClipSubmission,
}

async fn create_challenge_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateChallengeBody>,
) -> EngineResult<Json<CreateChallengeResponse>> {
    let actor = actor_of(&headers);
    let response = state
        .challenges
        .create_challenge(&actor, &body.opponent_id, body.clip)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct ClipBody {
    clip: ClipSubmission,
}

async fn accept_challenge_handler(
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ClipBody>,
) -> EngineResult<Json<AcceptChallengeResponse>> {
    let actor = actor_of(&headers);
    let response = state
        .challenges
        .accept_challenge(&actor, &challenge_id, body.clip)
        .await?;
    Ok(Json(response))
}

async fn resubmit_clip_handler(
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ClipBody>,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    state
        .challenges
        .resubmit_clip(&actor, &challenge_id, body.clip)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ChallengeVoteBody {
    voted_for: String,
}

async fn challenge_vote_handler(
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ChallengeVoteBody>,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    state
        .challenges
        .cast_vote(&actor, &challenge_id, &body.voted_for)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct SettleResponse {
    settled: bool,
}

async fn settle_challenge_handler(
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<String>,
) -> EngineResult<Json<SettleResponse>> {
    let settled = state.challenges.settle_challenge(&challenge_id).await?;
    Ok(Json(SettleResponse { settled }))
}

// ============================================================================
// BOUNTIES
// ============================================================================

async fn create_bounty_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBountyRequest>,
) -> EngineResult<Json<CreateBountyResponse>> {
    let actor = actor_of(&headers);
    let response = state.bounties.create_bounty(&actor, body).await?;
    Ok(Json(response))
}

async fn cancel_bounty_handler(
    State(state): State<Arc<AppState>>,
    Path(bounty_id): Path<String>,
    headers: HeaderMap,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    state.bounties.cancel_bounty(&actor, &bounty_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_claim_handler(
    State(state): State<Arc<AppState>>,
    Path(bounty_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SubmitClaimRequest>,
) -> EngineResult<Json<SubmitClaimResponse>> {
    let actor = actor_of(&headers);
    let response = state.bounties.submit_claim(&actor, &bounty_id, body).await?;
    Ok(Json(response))
}

async fn withdraw_claim_handler(
    State(state): State<Arc<AppState>>,
    Path((bounty_id, claim_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    // The claim doc id is the claimer id; withdrawing someone else's claim
    // would just fail the id match.
    if actor != claim_id {
        return Err(EngineError::PermissionDenied(
            "only the claimer can withdraw".into(),
        ));
    }
    state.bounties.withdraw_claim(&actor, &bounty_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct FilmerConfirmationBody {
    accept: bool,
}

async fn filmer_confirmation_handler(
    State(state): State<Arc<AppState>>,
    Path((bounty_id, claim_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<FilmerConfirmationBody>,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    state
        .bounties
        .confirm_filmer_tag(&actor, &bounty_id, &claim_id, body.accept)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ClaimVoteBody {
    approve: bool,
    comment: Option<String>,
}

async fn claim_vote_handler(
    State(state): State<Arc<AppState>>,
    Path((bounty_id, claim_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ClaimVoteBody>,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    state
        .bounties
        .cast_vote(&actor, &bounty_id, &claim_id, body.approve, body.comment)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DecisionBody {
    approve: bool,
    note: Option<String>,
}

async fn creator_decision_handler(
    State(state): State<Arc<AppState>>,
    Path((bounty_id, claim_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<DecisionBody>,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    state
        .bounties
        .creator_decision(&actor, &bounty_id, &claim_id, body.approve, body.note)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn payout_handler(
    State(state): State<Arc<AppState>>,
    Path((bounty_id, claim_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    state
        .bounties
        .pay_out_claim(&actor, &bounty_id, &claim_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// PIPELINE EVENTS
// ============================================================================

#[derive(Debug, Serialize)]
struct FinalizeResponse {
    outcome: String,
}

/// Blob-finalize webhook. Captures the clip document around the pipeline
/// run and fans the change out to the observer hub.
async fn finalize_event_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<FinalizeEvent>,
) -> EngineResult<Json<FinalizeResponse>> {
    let clip_path = crate::video::ClipRef::parse(&event.path).and_then(|r| match r {
        crate::video::ClipRef::Challenge {
            challenge_id,
            user_id,
        } => Some(paths::clip(&challenge_id, &user_id)),
        crate::video::ClipRef::Draft { .. } => None,
    });

    let before = match &clip_path {
        Some(p) => state.store.get_raw(p).await.map_err(EngineError::from)?,
        None => None,
    };

    let outcome = state.pipeline.handle_finalize(&event).await?;

    if let Some(p) = &clip_path {
        let after = state.store.get_raw(p).await.map_err(EngineError::from)?;
        state
            .hub
            .notify(DocUpdate {
                path: p.clone(),
                before: before.map(|(doc, _)| doc),
                after: after.map(|(doc, _)| doc),
            })
            .await;
    }

    let outcome = match outcome {
        PipelineOutcome::Ignored => "ignored",
        PipelineOutcome::Duplicate => "duplicate",
        PipelineOutcome::Valid => "valid",
        PipelineOutcome::Rejected(_) => "rejected",
    };
    Ok(Json(FinalizeResponse {
        outcome: outcome.to_string(),
    }))
}

// ============================================================================
// RATE LIMITS / MODERATION
// ============================================================================

async fn rate_limit_status_handler(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    headers: HeaderMap,
) -> EngineResult<Json<RateLimitStatus>> {
    let actor = actor_of(&headers);
    let action = ActionClass::parse(&action)
        .ok_or_else(|| EngineError::InvalidArgument(format!("unknown action {}", action)))?;
    let status = state.limiter.status(&actor, action).await?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
struct GrantRoleBody {
    role: Role,
}

async fn grant_role_handler(
    State(state): State<Arc<AppState>>,
    Path(target_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<GrantRoleBody>,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    let granter = crate::auth::require_user(state.store.as_ref(), &actor).await?;
    state
        .auth
        .grant_role(&granter.doc, &target_id, body.role)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AbusePenaltyBody {
    detail: String,
}

async fn abuse_penalty_handler(
    State(state): State<Arc<AppState>>,
    Path(target_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AbusePenaltyBody>,
) -> EngineResult<StatusCode> {
    let actor = actor_of(&headers);
    let moderator = crate::auth::require_user(state.store.as_ref(), &actor).await?;
    state
        .reputation
        .penalize_abuse(&moderator.doc, &target_id, &body.detail)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// RUN
// ============================================================================

pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("settlement server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
