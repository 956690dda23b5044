//! Ownership resolution over resource-relation facts.
//!
//! Facts live outside the engine (job assignment, invoice authorship,
//! customer/job linkage, explicit allow-list grants). [`RelationStore`] is the
//! seam to whatever holds them; [`OwnershipResolver`] applies the ownership
//! rules on top and owns the tenant short-circuit.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use super::filter::Row;
use super::models::{AccessContext, ResourceId, ResourceRef, ResourceType, TenantId, UserId};

/// Transport-level failure of a relation lookup.
#[derive(Debug, Error)]
pub enum OwnershipError {
    #[error("Relation store unavailable: {0}")]
    Unavailable(String),

    #[error("Relation query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Kind of relation a user holds on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Creator,
    Assignee,
    Grant,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Creator => "creator",
            Relation::Assignee => "assignee",
            Relation::Grant => "grant",
        }
    }
}

/// Read access to relation facts. All lookups are scoped by tenant.
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Whether `user` holds `relation` on the record.
    async fn has_relation(
        &self,
        tenant: &TenantId,
        resource_type: ResourceType,
        resource_id: &ResourceId,
        user: &UserId,
        relation: Relation,
    ) -> Result<bool, OwnershipError>;

    /// Whether `user` is assigned to any job linked to the customer.
    async fn has_linked_job_assignment(
        &self,
        tenant: &TenantId,
        customer_id: &ResourceId,
        user: &UserId,
    ) -> Result<bool, OwnershipError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolver
// ═══════════════════════════════════════════════════════════════════════════════

/// Answers "does the caller own / is the caller assigned to this record".
///
/// Nothing is cached across calls, so reassignment takes effect on the next
/// evaluation.
#[derive(Clone)]
pub struct OwnershipResolver {
    store: Arc<dyn RelationStore>,
}

impl OwnershipResolver {
    pub fn new(store: Arc<dyn RelationStore>) -> Self {
        Self { store }
    }

    pub async fn is_owner(
        &self,
        ctx: &AccessContext,
        resource: &ResourceRef,
    ) -> Result<bool, OwnershipError> {
        if ctx.tenant_id != resource.tenant_id {
            return Ok(false);
        }
        if resource.owner_id.as_ref() == Some(&ctx.user_id) {
            return Ok(true);
        }

        let created = self
            .store
            .has_relation(
                &resource.tenant_id,
                resource.resource_type,
                &resource.resource_id,
                &ctx.user_id,
                Relation::Creator,
            )
            .await?;
        trace!(resource_id = %resource.resource_id, user_id = %ctx.user_id, created, "Creator lookup");
        Ok(created)
    }

    pub async fn is_assigned(
        &self,
        ctx: &AccessContext,
        resource: &ResourceRef,
    ) -> Result<bool, OwnershipError> {
        if ctx.tenant_id != resource.tenant_id {
            return Ok(false);
        }
        if resource.assigned_user_ids.contains(&ctx.user_id) {
            return Ok(true);
        }

        for relation in [Relation::Assignee, Relation::Grant] {
            if self
                .store
                .has_relation(
                    &resource.tenant_id,
                    resource.resource_type,
                    &resource.resource_id,
                    &ctx.user_id,
                    relation,
                )
                .await?
            {
                return Ok(true);
            }
        }

        if resource.resource_type == ResourceType::Customer {
            return self
                .store
                .has_linked_job_assignment(&resource.tenant_id, &resource.resource_id, &ctx.user_id)
                .await;
        }

        Ok(false)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

type RecordKey = (TenantId, ResourceType, ResourceId);

/// Relation facts held in process. Default backend and test fixture.
#[derive(Debug, Default)]
pub struct InMemoryRelationStore {
    relations: DashMap<(RecordKey, Relation), HashSet<UserId>>,
    customer_jobs: DashMap<(TenantId, ResourceId), HashSet<ResourceId>>,
}

impl InMemoryRelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_relation(
        &self,
        tenant: impl Into<TenantId>,
        resource_type: ResourceType,
        resource_id: impl Into<ResourceId>,
        user: impl Into<UserId>,
        relation: Relation,
    ) {
        let key = ((tenant.into(), resource_type, resource_id.into()), relation);
        self.relations.entry(key).or_default().insert(user.into());
    }

    pub fn remove_relation(
        &self,
        tenant: impl Into<TenantId>,
        resource_type: ResourceType,
        resource_id: impl Into<ResourceId>,
        user: impl Into<UserId>,
        relation: Relation,
    ) {
        let key = ((tenant.into(), resource_type, resource_id.into()), relation);
        if let Some(mut users) = self.relations.get_mut(&key) {
            users.remove(&user.into());
        }
    }

    pub fn record_creator(
        &self,
        tenant: impl Into<TenantId>,
        resource_type: ResourceType,
        resource_id: impl Into<ResourceId>,
        user: impl Into<UserId>,
    ) {
        self.add_relation(tenant, resource_type, resource_id, user, Relation::Creator);
    }

    pub fn assign(
        &self,
        tenant: impl Into<TenantId>,
        resource_type: ResourceType,
        resource_id: impl Into<ResourceId>,
        user: impl Into<UserId>,
    ) {
        self.add_relation(tenant, resource_type, resource_id, user, Relation::Assignee);
    }

    pub fn unassign(
        &self,
        tenant: impl Into<TenantId>,
        resource_type: ResourceType,
        resource_id: impl Into<ResourceId>,
        user: impl Into<UserId>,
    ) {
        self.remove_relation(tenant, resource_type, resource_id, user, Relation::Assignee);
    }

    pub fn grant(
        &self,
        tenant: impl Into<TenantId>,
        resource_type: ResourceType,
        resource_id: impl Into<ResourceId>,
        user: impl Into<UserId>,
    ) {
        self.add_relation(tenant, resource_type, resource_id, user, Relation::Grant);
    }

    pub fn link_customer_job(
        &self,
        tenant: impl Into<TenantId>,
        customer_id: impl Into<ResourceId>,
        job_id: impl Into<ResourceId>,
    ) {
        self.customer_jobs
            .entry((tenant.into(), customer_id.into()))
            .or_default()
            .insert(job_id.into());
    }

    pub fn unlink_customer_job(
        &self,
        tenant: impl Into<TenantId>,
        customer_id: impl Into<ResourceId>,
        job_id: impl Into<ResourceId>,
    ) {
        if let Some(mut jobs) = self.customer_jobs.get_mut(&(tenant.into(), customer_id.into())) {
            jobs.remove(&job_id.into());
        }
    }

    fn users(&self, tenant: &TenantId, rt: ResourceType, id: &ResourceId, relation: Relation) -> Vec<UserId> {
        self.relations
            .get(&((tenant.clone(), rt, id.clone()), relation))
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The row a data-access layer would see for `resource`, with every
    /// relation the store knows about folded in.
    pub fn project(&self, resource: &ResourceRef) -> Row {
        let (tenant, rt, id) = (&resource.tenant_id, resource.resource_type, &resource.resource_id);

        let mut owner_ids: Vec<UserId> = resource.owner_id.iter().cloned().collect();
        owner_ids.extend(self.users(tenant, rt, id, Relation::Creator));

        let mut assigned_user_ids = resource.assigned_user_ids.clone();
        assigned_user_ids.extend(self.users(tenant, rt, id, Relation::Assignee));

        let linked_job_assignee_ids = if rt == ResourceType::Customer {
            self.customer_jobs
                .get(&(tenant.clone(), id.clone()))
                .map(|jobs| {
                    jobs.iter()
                        .flat_map(|job| self.users(tenant, ResourceType::Job, job, Relation::Assignee))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Row {
            tenant_id: tenant.clone(),
            owner_ids,
            assigned_user_ids,
            allowlisted_user_ids: self.users(tenant, rt, id, Relation::Grant),
            linked_job_assignee_ids,
        }
    }
}

#[async_trait]
impl RelationStore for InMemoryRelationStore {
    async fn has_relation(
        &self,
        tenant: &TenantId,
        resource_type: ResourceType,
        resource_id: &ResourceId,
        user: &UserId,
        relation: Relation,
    ) -> Result<bool, OwnershipError> {
        Ok(self
            .relations
            .get(&((tenant.clone(), resource_type, resource_id.clone()), relation))
            .map(|users| users.contains(user))
            .unwrap_or(false))
    }

    async fn has_linked_job_assignment(
        &self,
        tenant: &TenantId,
        customer_id: &ResourceId,
        user: &UserId,
    ) -> Result<bool, OwnershipError> {
        let jobs: Vec<ResourceId> = match self.customer_jobs.get(&(tenant.clone(), customer_id.clone())) {
            Some(jobs) => jobs.iter().cloned().collect(),
            None => return Ok(false),
        };

        for job in &jobs {
            if self
                .has_relation(tenant, ResourceType::Job, job, user, Relation::Assignee)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Postgres Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Relation facts in the `resource_relations` and `customer_jobs` tables.
#[derive(Debug, Clone)]
pub struct PgRelationStore {
    pool: PgPool,
}

impl PgRelationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationStore for PgRelationStore {
    async fn has_relation(
        &self,
        tenant: &TenantId,
        resource_type: ResourceType,
        resource_id: &ResourceId,
        user: &UserId,
        relation: Relation,
    ) -> Result<bool, OwnershipError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM resource_relations
                WHERE tenant_id = $1
                  AND resource_type = $2
                  AND resource_id = $3
                  AND user_id = $4
                  AND relation = $5
            )
            "#,
        )
        .bind(tenant.as_str())
        .bind(resource_type.as_str())
        .bind(resource_id.as_str())
        .bind(user.as_str())
        .bind(relation.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn has_linked_job_assignment(
        &self,
        tenant: &TenantId,
        customer_id: &ResourceId,
        user: &UserId,
    ) -> Result<bool, OwnershipError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM customer_jobs cj
                JOIN resource_relations r
                  ON r.tenant_id = cj.tenant_id
                 AND r.resource_type = 'job'
                 AND r.resource_id = cj.job_id
                 AND r.relation = 'assignee'
                WHERE cj.tenant_id = $1
                  AND cj.customer_id = $2
                  AND r.user_id = $3
            )
            "#,
        )
        .bind(tenant.as_str())
        .bind(customer_id.as_str())
        .bind(user.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::models::Role;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(tenant: &str, user: &str) -> AccessContext {
        AccessContext::new(tenant, user, Role::Staff, Utc::now() + Duration::hours(1))
    }

    /// Counts lookups so the tenant short-circuit can be observed.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryRelationStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RelationStore for CountingStore {
        async fn has_relation(
            &self,
            tenant: &TenantId,
            resource_type: ResourceType,
            resource_id: &ResourceId,
            user: &UserId,
            relation: Relation,
        ) -> Result<bool, OwnershipError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner
                .has_relation(tenant, resource_type, resource_id, user, relation)
                .await
        }

        async fn has_linked_job_assignment(
            &self,
            tenant: &TenantId,
            customer_id: &ResourceId,
            user: &UserId,
        ) -> Result<bool, OwnershipError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.has_linked_job_assignment(tenant, customer_id, user).await
        }
    }

    #[tokio::test]
    async fn test_cross_tenant_short_circuits_without_lookup() {
        let store = Arc::new(CountingStore::default());
        store.inner.record_creator("t2", ResourceType::Invoice, "inv-1", "u1");
        let resolver = OwnershipResolver::new(store.clone());

        let r = ResourceRef::new("t2", ResourceType::Invoice, "inv-1").owned_by("u1");
        assert!(!resolver.is_owner(&ctx("t1", "u1"), &r).await.unwrap());
        assert!(!resolver.is_assigned(&ctx("t1", "u1"), &r).await.unwrap());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_owner_by_field_or_creator_fact() {
        let store = Arc::new(InMemoryRelationStore::new());
        store.record_creator("t1", ResourceType::Invoice, "inv-2", "u1");
        let resolver = OwnershipResolver::new(store);

        let by_field = ResourceRef::new("t1", ResourceType::Invoice, "inv-1").owned_by("u1");
        let by_fact = ResourceRef::new("t1", ResourceType::Invoice, "inv-2");
        let neither = ResourceRef::new("t1", ResourceType::Invoice, "inv-3").owned_by("u9");

        assert!(resolver.is_owner(&ctx("t1", "u1"), &by_field).await.unwrap());
        assert!(resolver.is_owner(&ctx("t1", "u1"), &by_fact).await.unwrap());
        assert!(!resolver.is_owner(&ctx("t1", "u1"), &neither).await.unwrap());
    }

    #[tokio::test]
    async fn test_assignment_sources() {
        let store = Arc::new(InMemoryRelationStore::new());
        store.assign("t1", ResourceType::Job, "job-2", "u1");
        store.grant("t1", ResourceType::Job, "job-3", "u1");
        let resolver = OwnershipResolver::new(store);
        let c = ctx("t1", "u1");

        let listed = ResourceRef::new("t1", ResourceType::Job, "job-1").assigned_to("u1");
        assert!(resolver.is_assigned(&c, &listed).await.unwrap());
        let stored = ResourceRef::new("t1", ResourceType::Job, "job-2");
        assert!(resolver.is_assigned(&c, &stored).await.unwrap());
        let granted = ResourceRef::new("t1", ResourceType::Job, "job-3");
        assert!(resolver.is_assigned(&c, &granted).await.unwrap());
        let other = ResourceRef::new("t1", ResourceType::Job, "job-4").assigned_to("u2");
        assert!(!resolver.is_assigned(&c, &other).await.unwrap());
    }

    #[tokio::test]
    async fn test_customer_visible_through_linked_job_until_reassigned() {
        let store = Arc::new(InMemoryRelationStore::new());
        store.link_customer_job("t1", "cust-1", "job-1");
        store.assign("t1", ResourceType::Job, "job-1", "u1");
        let resolver = OwnershipResolver::new(store.clone());

        let customer = ResourceRef::new("t1", ResourceType::Customer, "cust-1");
        assert!(resolver.is_assigned(&ctx("t1", "u1"), &customer).await.unwrap());

        store.unassign("t1", ResourceType::Job, "job-1", "u1");
        store.assign("t1", ResourceType::Job, "job-1", "u2");
        assert!(!resolver.is_assigned(&ctx("t1", "u1"), &customer).await.unwrap());
        assert!(resolver.is_assigned(&ctx("t1", "u2"), &customer).await.unwrap());
    }

    #[test]
    fn test_project_folds_store_facts() {
        let store = InMemoryRelationStore::new();
        store.record_creator("t1", ResourceType::Customer, "cust-1", "author");
        store.grant("t1", ResourceType::Customer, "cust-1", "partner");
        store.link_customer_job("t1", "cust-1", "job-1");
        store.assign("t1", ResourceType::Job, "job-1", "tech");

        let row = store.project(&ResourceRef::new("t1", ResourceType::Customer, "cust-1"));
        assert_eq!(row.owner_ids, vec![UserId::from("author")]);
        assert_eq!(row.allowlisted_user_ids, vec![UserId::from("partner")]);
        assert_eq!(row.linked_job_assignee_ids, vec![UserId::from("tech")]);
    }
}
