//! REST endpoints for the signup flow.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use crate::error::SignupError;

use super::manager::OnboardingManager;
use super::model::{
    AdvanceStageRequest, LoginRequest, RegistrationRequest, SignupStatusRequest,
};

/// Shared state for signup routes.
#[derive(Clone)]
pub struct SignupRouteState {
    pub manager: Arc<OnboardingManager>,
}

/// Build the signup REST routes.
pub fn signup_routes(manager: Arc<OnboardingManager>) -> Router {
    let state = SignupRouteState { manager };

    Router::new()
        .route("/health", get(health))
        .route("/api/signup/register", post(register))
        .route("/api/signup/login", post(login))
        .route("/api/signup/status", get(get_status).patch(update_status))
        .route("/api/signup/accounts/{id}/advance", post(advance_stage))
        .route("/api/signup/accounts/{id}/profile", patch(update_profile))
        .route("/api/signup/accounts/{id}/complete", post(complete))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

impl IntoResponse for SignupError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Internal(e) => {
                error!(error = %e, "Signup request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Credential(e) => {
                error!(error = %e, "Credential handling failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        let body = serde_json::json!({
            "error": {
                "reason": self.reason(),
                "message": self.public_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}

fn parse_account_id(id: &str) -> Result<Uuid, SignupError> {
    Uuid::parse_str(id).map_err(|_| SignupError::validation("Invalid account ID"))
}

/// Unwrap a JSON body, reporting malformed input as a validation failure.
fn json_body<T: DeserializeOwned>(body: Result<Json<T>, JsonRejection>) -> Result<T, SignupError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| SignupError::validation(rejection.body_text()))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "signup-engine"
    }))
}

// ── Registration ────────────────────────────────────────────────────────

/// POST /api/signup/register
async fn register(
    State(state): State<SignupRouteState>,
    body: Result<Json<RegistrationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, SignupError> {
    let registration = state.manager.register(json_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

/// POST /api/signup/login
async fn login(
    State(state): State<SignupRouteState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, SignupError> {
    let session = state.manager.login(json_body(body)?).await?;
    Ok(Json(session))
}

// ── Progress ────────────────────────────────────────────────────────────

/// POST /api/signup/accounts/{id}/advance
async fn advance_stage(
    State(state): State<SignupRouteState>,
    Path(id): Path<String>,
    body: Result<Json<AdvanceStageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, SignupError> {
    let account_id = parse_account_id(&id)?;
    let progress = state
        .manager
        .advance_stage(account_id, json_body(body)?)
        .await?;
    Ok(Json(progress))
}

/// GET /api/signup/status
async fn get_status(
    State(state): State<SignupRouteState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, SignupError> {
    let claims = state.manager.authenticate(bearer_token(&headers))?;
    let progress = state.manager.signup_progress(claims.sub).await?;
    Ok(Json(progress))
}

/// PATCH /api/signup/status
async fn update_status(
    State(state): State<SignupRouteState>,
    headers: HeaderMap,
    body: Result<Json<SignupStatusRequest>, JsonRejection>,
) -> Result<impl IntoResponse, SignupError> {
    let claims = state.manager.authenticate(bearer_token(&headers))?;
    let view = state
        .manager
        .update_signup_status(claims.sub, json_body(body)?)
        .await?;
    Ok(Json(view))
}

// ── Profile & completion ────────────────────────────────────────────────

/// PATCH /api/signup/accounts/{id}/profile
async fn update_profile(
    State(state): State<SignupRouteState>,
    Path(id): Path<String>,
    body: Result<Json<serde_json::Map<String, serde_json::Value>>, JsonRejection>,
) -> Result<impl IntoResponse, SignupError> {
    let account_id = parse_account_id(&id)?;
    state
        .manager
        .update_profile(account_id, &json_body(body)?)
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// POST /api/signup/accounts/{id}/complete
async fn complete(
    State(state): State<SignupRouteState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SignupError> {
    let account_id = parse_account_id(&id)?;
    let completed = state.manager.complete_registration(account_id).await?;
    Ok(Json(completed))
}
