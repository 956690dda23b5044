//! Tenant-isolated role-based authorization.
//!
//! This module provides:
//! - **Models**: tenants, users, the closed role/action/scope/resource catalogs
//! - **Policy**: versioned, immutable snapshots of the role matrix and their store
//! - **Ownership**: owner / assignee resolution over relation facts
//! - **Evaluator**: the decision function producing reason-coded decisions
//! - **Filter**: predicate generation for list queries, consistent with the evaluator
//!
//! # Usage
//!
//! ```rust,ignore
//! use tenantguard_core::rbac::{
//!     Action, InMemoryRelationStore, OwnershipResolver, PolicyEvaluator, PolicyStore,
//!     ResourceRef, ResourceType,
//! };
//!
//! let policies = Arc::new(PolicyStore::with_defaults()?);
//! let evaluator = PolicyEvaluator::new(
//!     policies,
//!     OwnershipResolver::new(Arc::new(InMemoryRelationStore::new())),
//! );
//!
//! let decision = evaluator
//!     .evaluate(&ctx, Action::Update, &ResourceRef::new("t1", ResourceType::Job, "job-7"))
//!     .await;
//! ```

pub mod evaluator;
pub mod filter;
pub mod models;
pub mod ownership;
pub mod policy;
pub mod roles;

pub use evaluator::{AccessDecision, PolicyEvaluator, ReasonCode, ResultCode};
pub use filter::{ColumnMap, Field, PredicateExpr, PredicateFilterGenerator, Row, SqlColumn, SqlFilter};
pub use models::{
    AccessContext, Action, ParseNameError, Permission, ResourceId, ResourceRef, ResourceType,
    Role, Scope, TenantId, User, UserId,
};
pub use ownership::{
    InMemoryRelationStore, OwnershipError, OwnershipResolver, PgRelationStore, Relation,
    RelationStore,
};
pub use policy::{EscalationGuard, PolicyConfig, PolicyLoadError, PolicyRule, PolicySnapshot, PolicyStore};
pub use roles::default_policy;
