#![allow(clippy::result_large_err)]
//! # Tenant Guard Core
//!
//! Tenant-isolated policy authorization for a multi-tenant field-service
//! platform.
//!
//! ## Architecture
//!
//! - **Auth**: resolves bearer tokens and partner API keys into an access context
//! - **RBAC**: versioned policy snapshots, ownership resolution, the decision
//!   function and list-query predicate generation
//! - **Audit**: non-blocking, batched decision trail with pluggable sinks
//! - **Engine**: the assembled components, built from configuration
//! - **API**: HTTP decision service over the engine
//! - **Telemetry**: structured logging, optional trace export, Prometheus metrics

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod rbac;
pub mod seed;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, GuardError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditConfig, AuditLogger, AuditRecord, AuditSink, MemoryAuditSink};
    pub use crate::auth::{
        AccessContextLayer, ApiKeyRegistry, AuthConfig, AuthError, Claims, ContextResolver,
        InMemoryUserDirectory, UserDirectory,
    };
    pub use crate::config::Config;
    pub use crate::engine::{bootstrap, AuthorizationEngine, EngineBuilder};
    pub use crate::error::{ErrorCode, ErrorContext, GuardError, Result};
    pub use crate::rbac::{
        default_policy, AccessContext, AccessDecision, Action, InMemoryRelationStore,
        OwnershipResolver, PolicyConfig, PolicyEvaluator, PolicyStore, PredicateExpr,
        PredicateFilterGenerator, ReasonCode, RelationStore, ResourceRef, ResourceType,
        ResultCode, Role, Scope, TenantId, User, UserId,
    };
}
