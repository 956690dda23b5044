//! API request handlers.
//!
//! Handlers return `Result<impl IntoResponse, GuardError>`; errors become
//! enveloped JSON with the matching status through `GuardError`'s
//! `IntoResponse`. A denial is a decision, not an error, and is returned
//! with 200.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::{ApiResponse, AppState, OPERATOR_TOKEN_HEADER};
use crate::error::{ErrorCode, GuardError};
use crate::rbac::{
    AccessContext, Action, PolicyConfig, PredicateExpr, ReasonCode, ResourceRef, ResultCode,
    SqlFilter,
};

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, GuardError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| GuardError::validation(rejection.body_text()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "policy_version": state.engine.policy_version(),
        "audit_pending": state.engine.audit().pending(),
        "timestamp": Utc::now().to_rfc3339()
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decisions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub action: Action,
    pub resource: ResourceRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub allowed: bool,
    pub reason_code: ReasonCode,
    pub result: ResultCode,
    #[serde(default)]
    pub field_allowlist: Option<Vec<String>>,
    pub policy_version: u64,
    pub evaluated_at: DateTime<Utc>,
}

pub async fn evaluate(
    State(state): State<AppState>,
    ctx: AccessContext,
    payload: Result<Json<DecisionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GuardError> {
    let req = json_body(payload)?;
    let decision = state.engine.authorize(&ctx, req.action, &req.resource).await;

    Ok(Json(ApiResponse::success(DecisionResponse {
        allowed: decision.allowed(),
        reason_code: decision.reason_code(),
        result: decision.result_code(),
        field_allowlist: decision.field_allowlist().map(|fields| fields.to_vec()),
        policy_version: decision.policy_version(),
        evaluated_at: decision.evaluated_at(),
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRequest {
    pub resource_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResponse {
    pub resource_type: String,
    pub predicate: PredicateExpr,
    /// The predicate rendered against the default column layout.
    pub sql: SqlFilter,
}

pub async fn filter(
    State(state): State<AppState>,
    ctx: AccessContext,
    payload: Result<Json<FilterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GuardError> {
    let req = json_body(payload)?;
    let predicate = state.engine.filter_for_name(&ctx, &req.resource_type);
    let sql = predicate.to_sql();

    Ok(Json(ApiResponse::success(FilterResponse {
        resource_type: req.resource_type,
        predicate,
        sql,
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyStatus {
    pub version: u64,
    pub rule_count: usize,
    pub escalation_guards: usize,
    pub loaded_at: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<String>,
}

impl PolicyStatus {
    fn current(state: &AppState) -> Self {
        let snapshot = state.engine.policy();
        Self {
            version: snapshot.version(),
            rule_count: snapshot.rule_count(),
            escalation_guards: snapshot.escalation_guards().len(),
            loaded_at: snapshot.loaded_at(),
            source: state
                .engine
                .policy_path()
                .map(|path| path.display().to_string()),
        }
    }
}

pub async fn policy_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(PolicyStatus::current(&state)))
}

/// Validate and activate a pushed policy.
///
/// The body is TOML when the content type says so, JSON otherwise.
pub async fn push_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, GuardError> {
    authorize_operator(&state, &headers)?;

    let text = std::str::from_utf8(&body)
        .map_err(|_| GuardError::validation("Policy body must be UTF-8"))?;
    let is_toml = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("toml"));
    let config = if is_toml {
        PolicyConfig::from_toml_str(text)?
    } else {
        PolicyConfig::from_json_str(text)?
    };

    let previous = state.engine.policy_version();
    let snapshot = state.engine.reload_policy(&config)?;
    info!(
        previous_version = previous,
        version = snapshot.version(),
        "Policy pushed by operator"
    );

    Ok((
        StatusCode::OK,
        Json(ApiResponse::success(PolicyStatus::current(&state))),
    ))
}

fn authorize_operator(state: &AppState, headers: &HeaderMap) -> Result<(), GuardError> {
    let expected = state.operator_token.as_deref().ok_or_else(|| {
        GuardError::new(
            ErrorCode::OperatorTokenInvalid,
            "Policy push is disabled on this server",
        )
    })?;

    let presented = headers
        .get(OPERATOR_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            GuardError::new(ErrorCode::OperatorTokenRequired, "Operator token is required")
        })?;

    if Sha256::digest(presented.as_bytes()) != Sha256::digest(expected.as_bytes()) {
        warn!("Policy push rejected: operator token mismatch");
        return Err(GuardError::new(
            ErrorCode::OperatorTokenInvalid,
            "Operator token rejected",
        ));
    }
    Ok(())
}
