//! Credential to [`AccessContext`] resolution.

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::directory::{ApiKeyRegistry, UserDirectory};
use super::AuthConfig;
use crate::rbac::{AccessContext, TenantId, UserId};

// ═══════════════════════════════════════════════════════════════════════════════
// Error Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure to establish who is calling. Distinct from an access denial.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication credentials")]
    MissingCredential,

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Session has expired")]
    SessionExpired,

    #[error("Account is deactivated")]
    AccountDeactivated,

    #[error("User directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("Authentication misconfigured: {0}")]
    Configuration(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "MISSING_CREDENTIAL",
            Self::InvalidCredential(_) => "INVALID_CREDENTIAL",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::AccountDeactivated => "ACCOUNT_DEACTIVATED",
            Self::DirectoryUnavailable(_) => "DIRECTORY_UNAVAILABLE",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential(_) | Self::SessionExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::AccountDeactivated => StatusCode::FORBIDDEN,
            Self::DirectoryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller.
    fn public_message(&self) -> &'static str {
        match self {
            Self::MissingCredential => "Authentication credentials are required",
            Self::InvalidCredential(_) => "The provided credential is invalid",
            Self::SessionExpired => "The session has expired",
            Self::AccountDeactivated => "This account has been deactivated",
            Self::DirectoryUnavailable(_) => "Authentication is temporarily unavailable",
            Self::Configuration(_) => "An authentication error occurred",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "data": null,
            "error": self.public_message(),
            "error_code": self.code(),
        });

        (self.status(), Json(body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JWT Claims
// ═══════════════════════════════════════════════════════════════════════════════

/// Bearer token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    /// Tenant the token was issued for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,

    /// Role at issuance. Informational; the directory record is authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default = "generate_jti")]
    pub jti: String,

    pub iat: i64,

    pub exp: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

fn generate_jti() -> String {
    Uuid::new_v4().to_string()
}

impl Claims {
    pub fn builder(user_id: impl Into<String>, tenant_id: impl Into<String>) -> ClaimsBuilder {
        ClaimsBuilder::new(user_id, tenant_id)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Builder for [`Claims`]. Tokens default to a one-hour lifetime.
pub struct ClaimsBuilder {
    claims: Claims,
}

impl ClaimsBuilder {
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            claims: Claims {
                sub: user_id.into(),
                tid: Some(tenant_id.into()),
                role: None,
                jti: generate_jti(),
                iat: now.timestamp(),
                exp: (now + Duration::hours(1)).timestamp(),
                iss: None,
                aud: None,
            },
        }
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.claims.role = Some(role.into());
        self
    }

    pub fn expires_in(mut self, duration: Duration) -> Self {
        self.claims.exp = (Utc::now() + duration).timestamp();
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.claims.exp = at.timestamp();
        self
    }

    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.claims.iss = Some(issuer.into());
        self
    }

    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.claims.aud = Some(audience.into());
        self
    }

    pub fn without_tenant(mut self) -> Self {
        self.claims.tid = None;
        self
    }

    pub fn build(self) -> Claims {
        self.claims
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Credentials
// ═══════════════════════════════════════════════════════════════════════════════

/// An inbound credential, as presented.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Bearer([REDACTED])"),
            Self::ApiKey(_) => f.write_str("ApiKey([REDACTED])"),
        }
    }
}

impl Credential {
    /// Pull a credential from request headers. A bearer token wins when both
    /// are present.
    pub fn from_headers(headers: &HeaderMap, api_key_header: &str) -> Option<Self> {
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer ").or_else(|| s.strip_prefix("bearer ")))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if let Some(token) = bearer {
            return Some(Self::Bearer(token));
        }

        headers
            .get(api_key_header)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(Self::ApiKey)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolver
// ═══════════════════════════════════════════════════════════════════════════════

/// Turns credentials into access contexts.
///
/// The tenant comes only from the verified credential, and the role only from
/// the user directory.
pub struct ContextResolver {
    config: AuthConfig,
    encoding_key: Option<EncodingKey>,
    decoding_key: Option<DecodingKey>,
    validation: Validation,
    directory: Arc<dyn UserDirectory>,
    api_keys: Arc<ApiKeyRegistry>,
}

impl ContextResolver {
    pub fn new(
        config: AuthConfig,
        directory: Arc<dyn UserDirectory>,
        api_keys: Arc<ApiKeyRegistry>,
    ) -> Result<Self, AuthError> {
        let algorithm = Algorithm::from_str(&config.jwt_algorithm).map_err(|_| {
            AuthError::Configuration(format!("Unsupported JWT algorithm: {}", config.jwt_algorithm))
        })?;

        let (encoding_key, decoding_key) = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => match &config.jwt_secret {
                Some(secret) => (
                    Some(EncodingKey::from_secret(secret.as_bytes())),
                    Some(DecodingKey::from_secret(secret.as_bytes())),
                ),
                None => {
                    warn!("No JWT secret configured; bearer tokens will be rejected");
                    (None, None)
                }
            },
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let pem = config.jwt_public_key.as_ref().ok_or_else(|| {
                    AuthError::Configuration("JWT public key required for RSA algorithms".into())
                })?;
                let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| AuthError::Configuration(format!("Invalid RSA public key: {}", e)))?;
                (None, Some(key))
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                let pem = config.jwt_public_key.as_ref().ok_or_else(|| {
                    AuthError::Configuration("JWT public key required for EC algorithms".into())
                })?;
                let key = DecodingKey::from_ec_pem(pem.as_bytes())
                    .map_err(|e| AuthError::Configuration(format!("Invalid EC public key: {}", e)))?;
                (None, Some(key))
            }
            other => {
                return Err(AuthError::Configuration(format!(
                    "Unsupported JWT algorithm: {:?}",
                    other
                )));
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.leeway_secs;
        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match config.audience {
            Some(ref audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            config,
            encoding_key,
            decoding_key,
            validation,
            directory,
            api_keys,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn api_keys(&self) -> &Arc<ApiKeyRegistry> {
        &self.api_keys
    }

    /// Resolve request headers, failing with `MissingCredential` when none
    /// are present.
    pub async fn resolve_headers(&self, headers: &HeaderMap) -> Result<AccessContext, AuthError> {
        match Credential::from_headers(headers, &self.config.api_key_header) {
            Some(credential) => self.resolve(&credential).await,
            None => {
                counter!("tenantguard_auth_failures_total", "error" => "MISSING_CREDENTIAL")
                    .increment(1);
                Err(AuthError::MissingCredential)
            }
        }
    }

    pub async fn resolve(&self, credential: &Credential) -> Result<AccessContext, AuthError> {
        let result = match credential {
            Credential::Bearer(token) => self.resolve_bearer(token).await,
            Credential::ApiKey(key) => self.resolve_api_key(key).await,
        };

        if let Err(ref e) = result {
            counter!("tenantguard_auth_failures_total", "error" => e.code()).increment(1);
            debug!(error = %e, credential = ?credential, "Credential rejected");
        }
        result
    }

    async fn resolve_bearer(&self, token: &str) -> Result<AccessContext, AuthError> {
        let key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::InvalidCredential("bearer tokens are not accepted".into()))?;

        let claims = decode::<Claims>(token, key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::SessionExpired,
                _ => AuthError::InvalidCredential(e.to_string()),
            })?
            .claims;

        let tenant = claims
            .tid
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::InvalidCredential("token carries no tenant claim".into()))?;

        let expires_at = claims
            .expires_at()
            .ok_or_else(|| AuthError::InvalidCredential("token expiry out of range".into()))?;
        // The decoder applies leeway to `exp`; the session itself ends at `exp`.
        if expires_at <= Utc::now() {
            return Err(AuthError::SessionExpired);
        }

        self.bind(TenantId::new(tenant), UserId::new(claims.sub), expires_at)
            .await
    }

    async fn resolve_api_key(&self, raw: &str) -> Result<AccessContext, AuthError> {
        let entry = self
            .api_keys
            .lookup(raw)
            .ok_or_else(|| AuthError::InvalidCredential("unknown API key".into()))?;

        let now = Utc::now();
        if entry.expires_at.is_some_and(|at| at <= now) {
            return Err(AuthError::SessionExpired);
        }

        let ttl = Duration::from_std(self.config.api_key_session_ttl)
            .unwrap_or_else(|_| Duration::minutes(15));
        let session_end = now + ttl;
        let expires_at = entry
            .expires_at
            .map(|at| at.min(session_end))
            .unwrap_or(session_end);

        self.bind(entry.tenant_id, entry.user_id, expires_at).await
    }

    /// Confirm the user exists and is active in the credential's tenant.
    async fn bind(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        session_expires_at: DateTime<Utc>,
    ) -> Result<AccessContext, AuthError> {
        let user = self
            .directory
            .find_user(&tenant_id, &user_id)
            .await?
            .ok_or_else(|| AuthError::InvalidCredential("user not found in tenant".into()))?;

        if user.tenant_id != tenant_id {
            error!(
                tenant_id = %tenant_id,
                user_tenant_id = %user.tenant_id,
                user_id = %user_id,
                "Directory returned a user from another tenant"
            );
            return Err(AuthError::InvalidCredential("user not found in tenant".into()));
        }
        if !user.active {
            return Err(AuthError::AccountDeactivated);
        }

        Ok(AccessContext::new(tenant_id, user_id, user.role, session_expires_at))
    }

    /// Sign claims with the configured secret. Only HMAC setups can issue.
    pub fn issue_token(&self, claims: &Claims) -> Result<String, AuthError> {
        let key = self.encoding_key.as_ref().ok_or_else(|| {
            AuthError::Configuration("token issuance requires an HMAC secret".into())
        })?;

        encode(&Header::new(self.validation.algorithms[0]), claims, key)
            .map_err(|e| AuthError::Configuration(format!("Failed to sign token: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_preferred_over_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("x-api-key", HeaderValue::from_static("key"));
        assert_eq!(
            Credential::from_headers(&headers, "X-API-Key"),
            Some(Credential::Bearer("abc".into()))
        );
    }

    #[test]
    fn test_blank_credentials_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer   "));
        assert_eq!(Credential::from_headers(&headers, "X-API-Key"), None);

        headers.insert("x-api-key", HeaderValue::from_static("k1"));
        assert_eq!(
            Credential::from_headers(&headers, "X-API-Key"),
            Some(Credential::ApiKey("k1".into()))
        );
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let c = Credential::Bearer("secret-token".into());
        assert!(!format!("{:?}", c).contains("secret-token"));
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(AuthError::SessionExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::AccountDeactivated.status(), StatusCode::FORBIDDEN);
        assert_eq!(AuthError::InvalidCredential("x".into()).code(), "INVALID_CREDENTIAL");
    }

    #[test]
    fn test_claims_builder() {
        let claims = Claims::builder("u1", "t1").role("staff").issuer("tg").build();
        assert_eq!(claims.tid.as_deref(), Some("t1"));
        assert!(claims.exp > claims.iat);
        assert!(Claims::builder("u1", "t1").without_tenant().build().tid.is_none());
    }
}
