//! Seed data for the in-memory backends.
//!
//! ```toml
//! [[users]]
//! id = "u-42"
//! tenant_id = "acme"
//! role = "staff"
//!
//! [[relations]]
//! tenant_id = "acme"
//! resource_type = "job"
//! resource_id = "job-7"
//! user_id = "u-42"
//! relation = "assignee"
//!
//! [[customer_jobs]]
//! tenant_id = "acme"
//! customer_id = "cust-1"
//! job_id = "job-7"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::auth::{ApiKeyEntry, ApiKeyRegistry, InMemoryUserDirectory};
use crate::error::{ErrorCode, GuardError, Result};
use crate::rbac::{InMemoryRelationStore, Relation, ResourceId, ResourceType, TenantId, User, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationFact {
    pub tenant_id: TenantId,
    pub resource_type: ResourceType,
    pub resource_id: ResourceId,
    pub user_id: UserId,
    pub relation: Relation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomerJobLink {
    pub tenant_id: TenantId,
    pub customer_id: ResourceId,
    pub job_id: ResourceId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedData {
    #[serde(default)]
    pub users: Vec<User>,

    #[serde(default)]
    pub relations: Vec<RelationFact>,

    #[serde(default)]
    pub customer_jobs: Vec<CustomerJobLink>,

    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

impl SeedData {
    /// Read a seed file; `.json` is parsed as JSON, anything else as TOML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GuardError::with_internal(
                ErrorCode::ConfigurationError,
                "Seed file could not be read",
                format!("{}: {}", path.display(), e),
            )
            .with_source(e)
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&raw)?)
        } else {
            Ok(toml::from_str(&raw)?)
        }
    }

    pub fn apply_relations(&self, store: &InMemoryRelationStore) {
        for fact in &self.relations {
            store.add_relation(
                fact.tenant_id.clone(),
                fact.resource_type,
                fact.resource_id.clone(),
                fact.user_id.clone(),
                fact.relation,
            );
        }
        for link in &self.customer_jobs {
            store.link_customer_job(
                link.tenant_id.clone(),
                link.customer_id.clone(),
                link.job_id.clone(),
            );
        }
    }

    pub fn apply_users(&self, directory: &InMemoryUserDirectory) {
        for user in &self.users {
            directory.upsert(user.clone());
        }
    }

    pub fn apply_api_keys(&self, registry: &ApiKeyRegistry) {
        for entry in &self.api_keys {
            registry.register(entry.clone());
        }
    }
}
