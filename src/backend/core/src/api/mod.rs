//! HTTP decision service.
//!
//! Exposes the engine to services written in other languages:
//!
//! - `GET /health`, `GET /metrics` are public
//! - `POST /v1/decisions` and `POST /v1/filters` resolve the caller from the
//!   request credential through [`AccessContextLayer`]; the body never
//!   supplies identity
//! - `GET /v1/policy` reports the live policy; `PUT /v1/policy` activates a
//!   pushed policy and requires `X-Operator-Token`
//!
//! Every JSON response uses the [`ApiResponse`] envelope.

mod handlers;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::AccessContextLayer;
use crate::config::ServerConfig;
use crate::engine::AuthorizationEngine;
use crate::error::GuardError;
use crate::telemetry::MetricsRegistry;

pub use handlers::{DecisionRequest, DecisionResponse, FilterRequest, FilterResponse, PolicyStatus};

/// Header carrying the operator token for policy pushes.
pub const OPERATOR_TOKEN_HEADER: &str = "x-operator-token";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AuthorizationEngine>,
    pub metrics: MetricsRegistry,
    pub operator_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(engine: Arc<AuthorizationEngine>, metrics: MetricsRegistry) -> Self {
        Self {
            engine,
            metrics,
            operator_token: None,
        }
    }

    pub fn with_operator_token(mut self, token: Option<String>) -> Self {
        self.operator_token = token.filter(|t| !t.is_empty()).map(Arc::from);
        self
    }
}

/// Build the router. Decision and filter routes sit behind the access
/// context layer; everything else is reachable without a credential.
pub fn build_router(state: AppState, server: &ServerConfig) -> Router {
    let cors = if server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = server
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let authenticated = Router::new()
        .route("/v1/decisions", post(handlers::evaluate))
        .route("/v1/filters", post(handlers::filter))
        .route_layer(AccessContextLayer::new(state.engine.resolver().clone()));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route(
            "/v1/policy",
            get(handlers::policy_status).put(handlers::push_policy),
        )
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn from_error(err: &GuardError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.user_message().to_string()),
            error_code: Some(err.code().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, Some("test data"));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_api_response_from_error() {
        let err = GuardError::new(ErrorCode::OperatorTokenInvalid, "Operator token rejected");
        let response: ApiResponse<()> = ApiResponse::from_error(&err);
        assert!(!response.success);
        assert_eq!(response.error_code.as_deref(), Some("OPERATOR_TOKEN_INVALID"));
    }

    #[tokio::test]
    async fn test_blank_operator_token_disables_push() {
        let (engine, _worker) =
            AuthorizationEngine::builder(Arc::new(crate::rbac::PolicyStore::with_defaults().unwrap()))
                .build()
                .unwrap();
        let state = AppState::new(Arc::new(engine), MetricsRegistry::disabled())
            .with_operator_token(Some(String::new()));
        assert!(state.operator_token.is_none());
    }
}
