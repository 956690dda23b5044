//! Authentication: resolving inbound credentials into an
//! [`AccessContext`](crate::rbac::AccessContext).
//!
//! Two credential kinds are accepted:
//! - a bearer JWT carrying the tenant in its `tid` claim
//! - a partner API key bound to a tenant and user at issuance
//!
//! Either way the user must exist and be active in that tenant, and the role
//! is read from the user directory.
//!
//! # Example
//!
//! ```rust,ignore
//! use tenantguard_core::auth::{AccessContextLayer, ApiKeyRegistry, AuthConfig, ContextResolver};
//!
//! let resolver = ContextResolver::new(config, directory, Arc::new(ApiKeyRegistry::new()))?;
//! let app = Router::new()
//!     .route("/v1/decisions", post(evaluate))
//!     .route_layer(AccessContextLayer::new(Arc::new(resolver)));
//! ```

pub mod directory;
pub mod middleware;
pub mod resolver;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use directory::{
    ApiKeyEntry, ApiKeyRegistry, InMemoryUserDirectory, IssuedApiKey, PgUserDirectory,
    UserDirectory,
};
pub use middleware::{AccessContextLayer, AccessContextService};
pub use resolver::{AuthError, Claims, ClaimsBuilder, ContextResolver, Credential};

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret for HS256/HS384/HS512.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// PEM public key for RS*/ES* algorithms.
    #[serde(default)]
    pub jwt_public_key: Option<String>,

    #[serde(default = "default_jwt_algorithm")]
    pub jwt_algorithm: String,

    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default)]
    pub audience: Option<String>,

    /// Clock skew tolerated by the token decoder. Never extends a session past `exp`.
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,

    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Lifetime of a context resolved from an API key without its own expiry.
    #[serde(default = "default_api_key_session_ttl", with = "humantime_serde")]
    pub api_key_session_ttl: Duration,

    /// Pre-provisioned partner keys (hashed).
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_leeway_secs() -> u64 {
    30
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_api_key_session_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_public_key: None,
            jwt_algorithm: default_jwt_algorithm(),
            issuer: None,
            audience: None,
            leeway_secs: default_leeway_secs(),
            api_key_header: default_api_key_header(),
            api_key_session_ttl: default_api_key_session_ttl(),
            api_keys: Vec::new(),
        }
    }
}

impl AuthConfig {
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: Some(secret.into()),
            ..Self::default()
        }
    }
}
