//! HTTP surface: inbound SMS webhook plus bearer-protected admin routes.

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::conversation::ConversationEngine;
use crate::error::{DatabaseError, Error};
use crate::injector::{InjectRequest, Injector};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConversationEngine>,
    pub injector: Arc<Injector>,
    /// Admin routes answer 403 when unset.
    pub admin_token: Option<SecretString>,
}

/// Build the router with inbound, admin and health routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sms/inbound", post(inbound))
        .route("/admin/inject", post(inject))
        .route("/admin/reap", post(reap))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "sms-cadence"
    }))
}

// ── Inbound ─────────────────────────────────────────────────────────────

/// Provider webhook form. Field names follow the Twilio webhook.
#[derive(Debug, Deserialize)]
struct InboundForm {
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "Body", default)]
    body: String,
}

async fn inbound(State(state): State<AppState>, Form(form): Form<InboundForm>) -> impl IntoResponse {
    let outcome = state.engine.handle_reply(&form.from, &form.body, Utc::now()).await;
    Json(outcome)
}

// ── Admin ───────────────────────────────────────────────────────────────

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Check the `Authorization: Bearer` header against the configured token.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.admin_token else {
        return Err(error_response(StatusCode::FORBIDDEN, "admin routes disabled"));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token == expected.expose_secret() => Ok(()),
        _ => {
            warn!("Rejected admin request with bad or missing token");
            Err(error_response(StatusCode::UNAUTHORIZED, "invalid admin token"))
        }
    }
}

async fn inject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InjectRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    info!(template_id = %req.template_id, priority = req.priority, "Admin injection requested");

    match state.injector.inject(req).await {
        Ok(report) => Json(report).into_response(),
        Err(Error::Validation(e)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(Error::Database(DatabaseError::Constraint(msg))) => {
            error_response(StatusCode::CONFLICT, msg)
        }
        Err(e) => {
            warn!("Injection failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn reap(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.injector.purge_terminal().await {
        Ok(purged) => Json(serde_json::json!({ "purged": purged })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
