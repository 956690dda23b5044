//! User records and partner API keys backing the context resolver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use super::resolver::AuthError;
use crate::rbac::{Role, TenantId, User, UserId};

// ═══════════════════════════════════════════════════════════════════════════════
// User Directory
// ═══════════════════════════════════════════════════════════════════════════════

/// Source of truth for user records.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look a user up within a tenant. `Ok(None)` when the user does not
    /// exist there.
    async fn find_user(&self, tenant: &TenantId, user: &UserId) -> Result<Option<User>, AuthError>;
}

/// Directory held in process.
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<(TenantId, UserId), User>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let directory = Self::new();
        for user in users {
            directory.upsert(user);
        }
        directory
    }

    pub fn upsert(&self, user: User) {
        self.users
            .insert((user.tenant_id.clone(), user.id.clone()), user);
    }

    pub fn set_role(&self, tenant: &TenantId, user: &UserId, role: Role) -> bool {
        match self.users.get_mut(&(tenant.clone(), user.clone())) {
            Some(mut record) => {
                record.role = role;
                true
            }
            None => false,
        }
    }

    pub fn set_active(&self, tenant: &TenantId, user: &UserId, active: bool) -> bool {
        match self.users.get_mut(&(tenant.clone(), user.clone())) {
            Some(mut record) => {
                record.active = active;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_user(&self, tenant: &TenantId, user: &UserId) -> Result<Option<User>, AuthError> {
        Ok(self
            .users
            .get(&(tenant.clone(), user.clone()))
            .map(|record| record.clone()))
    }
}

/// Directory backed by the `users` table.
#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_user(&self, tenant: &TenantId, user: &UserId) -> Result<Option<User>, AuthError> {
        let row = sqlx::query_as::<_, (String, String, String, bool)>(
            r#"
            SELECT id, tenant_id, role, active
            FROM users
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant.as_str())
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthError::DirectoryUnavailable(e.to_string()))?;

        let Some((id, tenant_id, role, active)) = row else {
            return Ok(None);
        };

        let role = role.parse::<Role>().map_err(|e| {
            error!(tenant_id = %tenant_id, user_id = %id, error = %e, "User record holds an unknown role");
            AuthError::InvalidCredential("user record is malformed".into())
        })?;

        Ok(Some(User {
            id: UserId::new(id),
            tenant_id: TenantId::new(tenant_id),
            role,
            active,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Keys
// ═══════════════════════════════════════════════════════════════════════════════

/// A partner key, stored by hash and bound to one tenant and user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key_id: String,
    /// Hex SHA-256 of the raw key.
    pub key_sha256: String,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A freshly issued key. The raw value is shown once and never stored.
#[derive(Debug, Clone)]
pub struct IssuedApiKey {
    pub raw_key: String,
    pub entry: ApiKeyEntry,
}

/// Registry of partner keys, indexed by hash.
#[derive(Debug, Default)]
pub struct ApiKeyRegistry {
    keys: DashMap<String, ApiKeyEntry>,
}

impl ApiKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ApiKeyEntry>) -> Self {
        let registry = Self::new();
        for entry in entries {
            registry.register(entry);
        }
        registry
    }

    pub fn hash_key(raw: &str) -> String {
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    /// Mint a new key for `user` in `tenant`.
    pub fn issue(
        &self,
        tenant: impl Into<TenantId>,
        user: impl Into<UserId>,
        expires_at: Option<DateTime<Utc>>,
    ) -> IssuedApiKey {
        let raw_key = format!(
            "tgk_{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let entry = ApiKeyEntry {
            key_id: Uuid::new_v4().to_string(),
            key_sha256: Self::hash_key(&raw_key),
            tenant_id: tenant.into(),
            user_id: user.into(),
            expires_at,
        };
        self.register(entry.clone());
        IssuedApiKey { raw_key, entry }
    }

    pub fn register(&self, entry: ApiKeyEntry) {
        self.keys
            .insert(entry.key_sha256.to_ascii_lowercase(), entry);
    }

    /// Remove a key by id. Returns whether anything was removed.
    pub fn revoke(&self, key_id: &str) -> bool {
        let before = self.keys.len();
        self.keys.retain(|_, entry| entry.key_id != key_id);
        self.keys.len() < before
    }

    pub fn lookup(&self, raw_key: &str) -> Option<ApiKeyEntry> {
        self.keys
            .get(&Self::hash_key(raw_key))
            .map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
