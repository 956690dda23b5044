//! HTTP decision service tests.
//!
//! Tests cover:
//! - Public health, metrics and policy status endpoints
//! - Credential handling on decision and filter routes
//! - Decision and filter responses
//! - Operator-gated policy pushes

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use tenantguard_core::api::{build_router, AppState, OPERATOR_TOKEN_HEADER};
use tenantguard_core::auth::{ApiKeyRegistry, AuthConfig, Claims, InMemoryUserDirectory};
use tenantguard_core::config::ServerConfig;
use tenantguard_core::engine::AuthorizationEngine;
use tenantguard_core::rbac::{
    default_policy, InMemoryRelationStore, PolicyStore, ResourceType, Role, User,
};
use tenantguard_core::telemetry::MetricsRegistry;

const SECRET: &str = "api-test-secret";
const OPERATOR_TOKEN: &str = "operator-secret";

struct TestApp {
    router: Router,
    engine: Arc<AuthorizationEngine>,
    api_keys: Arc<ApiKeyRegistry>,
}

fn app() -> TestApp {
    let directory = Arc::new(InMemoryUserDirectory::with_users([
        User::new("owner-1", "t1", Role::Owner),
        User::new("tech-1", "t1", Role::Staff),
        User::new("partner-1", "t1", Role::ApiPartner),
        User::new("gone-1", "t1", Role::Viewer).deactivated(),
    ]));
    let relations = Arc::new(InMemoryRelationStore::new());
    relations.assign("t1", ResourceType::Job, "job-1", "tech-1");
    let api_keys = Arc::new(ApiKeyRegistry::new());

    let (engine, _worker) = AuthorizationEngine::builder(Arc::new(PolicyStore::with_defaults().unwrap()))
        .auth(AuthConfig::with_secret(SECRET))
        .directory(directory)
        .relations(relations)
        .api_keys(api_keys.clone())
        .build()
        .unwrap();
    let engine = Arc::new(engine);

    let state = AppState::new(engine.clone(), MetricsRegistry::detached())
        .with_operator_token(Some(OPERATOR_TOKEN.to_string()));
    TestApp {
        router: build_router(state, &ServerConfig::default()),
        engine,
        api_keys,
    }
}

fn token(app: &TestApp, user: &str, tenant: &str) -> String {
    app.engine
        .resolver()
        .issue_token(&Claims::builder(user, tenant).build())
        .unwrap()
}

fn post_json(uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, body)
}

// ============================================================================
// Public Endpoints
// ============================================================================

#[tokio::test]
async fn test_health_reports_policy_version() {
    let app = app();
    let request = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["policy_version"], default_policy().version);
}

#[tokio::test]
async fn test_metrics_endpoint_is_text() {
    let app = app();
    let response = app
        .router
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_policy_status() {
    let app = app();
    let request = Request::get("/v1/policy").body(Body::empty()).unwrap();
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["version"], default_policy().version);
    assert_eq!(body["data"]["escalation_guards"], 1);
}

// ============================================================================
// Credentials
// ============================================================================

#[tokio::test]
async fn test_decision_without_credential_is_401() {
    let app = app();
    let request = post_json(
        "/v1/decisions",
        None,
        json!({"action": "read", "resource": {"tenant_id": "t1", "resource_type": "job", "resource_id": "job-1"}}),
    );
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "MISSING_CREDENTIAL");
}

#[tokio::test]
async fn test_garbage_token_is_401() {
    let app = app();
    let request = post_json("/v1/filters", Some("not-a-jwt"), json!({"resource_type": "job"}));
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "INVALID_CREDENTIAL");
}

#[tokio::test]
async fn test_deactivated_account_is_403() {
    let app = app();
    let token = token(&app, "gone-1", "t1");
    let request = post_json("/v1/filters", Some(&token), json!({"resource_type": "job"}));
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "ACCOUNT_DEACTIVATED");
}

// ============================================================================
// Decisions
// ============================================================================

#[tokio::test]
async fn test_assigned_job_update_allowed() {
    let app = app();
    let token = token(&app, "tech-1", "t1");
    let request = post_json(
        "/v1/decisions",
        Some(&token),
        json!({"action": "update", "resource": {"tenant_id": "t1", "resource_type": "job", "resource_id": "job-1"}}),
    );
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["allowed"], true);
    assert_eq!(body["data"]["reason_code"], "assignment_match");
    assert_eq!(body["data"]["result"], "ALLOWED");
}

#[tokio::test]
async fn test_cross_tenant_denial_is_200_with_reason() {
    let app = app();
    let token = token(&app, "owner-1", "t1");
    let request = post_json(
        "/v1/decisions",
        Some(&token),
        json!({"action": "read", "resource": {"tenant_id": "t2", "resource_type": "invoice", "resource_id": "inv-1"}}),
    );
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["allowed"], false);
    assert_eq!(body["data"]["reason_code"], "cross_tenant_access");
    assert_eq!(body["data"]["result"], "RLS_VIOLATION_ERROR");
}

#[tokio::test]
async fn test_partner_key_decision_carries_allowlist() {
    let app = app();
    let issued = app.api_keys.issue("t1", "partner-1", None);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/decisions")
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-API-Key", issued.raw_key.as_str())
        .body(Body::from(
            json!({"action": "read", "resource": {
                "tenant_id": "t1", "resource_type": "customer", "resource_id": "c1",
                "assigned_user_ids": ["partner-1"]
            }})
            .to_string(),
        ))
        .unwrap();
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["allowed"], true);
    let fields = body["data"]["field_allowlist"].as_array().unwrap();
    assert!(fields.iter().any(|f| f == "name"));
}

#[tokio::test]
async fn test_unknown_action_is_422() {
    let app = app();
    let token = token(&app, "owner-1", "t1");
    let request = post_json(
        "/v1/decisions",
        Some(&token),
        json!({"action": "approve", "resource": {"tenant_id": "t1", "resource_type": "job", "resource_id": "j"}}),
    );
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "VALIDATION_ERROR");
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test]
async fn test_staff_job_filter() {
    let app = app();
    let token = token(&app, "tech-1", "t1");
    let request = post_json("/v1/filters", Some(&token), json!({"resource_type": "job"}));
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    let sql = &body["data"]["sql"];
    assert!(sql["clause"].as_str().unwrap().contains("tenant_id"));
    assert!(sql["params"].as_array().unwrap().iter().any(|p| p == "t1"));
    assert!(sql["params"].as_array().unwrap().iter().any(|p| p == "tech-1"));
}

#[tokio::test]
async fn test_unknown_resource_type_filter_is_false() {
    let app = app();
    let token = token(&app, "owner-1", "t1");
    let request = post_json("/v1/filters", Some(&token), json!({"resource_type": "spaceship"}));
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["sql"]["clause"], "FALSE");
}

// ============================================================================
// Policy Push
// ============================================================================

fn push(body: String, content_type: &str, operator_token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::PUT)
        .uri("/v1/policy")
        .header(header::CONTENT_TYPE, content_type);
    if let Some(token) = operator_token {
        builder = builder.header(OPERATOR_TOKEN_HEADER, token);
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn test_push_requires_operator_token() {
    let app = app();
    let body = serde_json::to_string(&default_policy()).unwrap();

    let (status, payload) = send(&app.router, push(body.clone(), "application/json", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["error_code"], "OPERATOR_TOKEN_REQUIRED");

    let (status, payload) =
        send(&app.router, push(body, "application/json", Some("wrong"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(payload["error_code"], "OPERATOR_TOKEN_INVALID");
}

#[tokio::test]
async fn test_push_toml_activates_policy() {
    let app = app();
    let mut next = default_policy();
    next.version += 1;
    let body = next.to_toml_string().unwrap();

    let (status, payload) =
        send(&app.router, push(body, "application/toml", Some(OPERATOR_TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["data"]["version"], next.version);
    assert_eq!(app.engine.policy_version(), next.version);
}

#[tokio::test]
async fn test_push_stale_version_is_409() {
    let app = app();
    let body = serde_json::to_string(&default_policy()).unwrap();

    let (status, payload) =
        send(&app.router, push(body, "application/json", Some(OPERATOR_TOKEN))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(payload["error_code"], "STALE_POLICY_VERSION");
}

#[tokio::test]
async fn test_push_invalid_policy_keeps_live_version() {
    let app = app();
    let before = app.engine.policy_version();
    let body = json!({"version": before + 1, "rules": [{"role": "janitor"}]}).to_string();

    let (status, payload) =
        send(&app.router, push(body, "application/json", Some(OPERATOR_TOKEN))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(payload["error_code"], "POLICY_LOAD_FAILED");
    assert_eq!(app.engine.policy_version(), before);
}
