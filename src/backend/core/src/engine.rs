//! The assembled authorization engine.
//!
//! [`AuthorizationEngine`] wires the policy store, context resolver,
//! evaluator, filter generator and audit logger together. Library callers
//! build one with [`EngineBuilder`]; the server builds one from [`Config`]
//! with [`bootstrap`].

use axum::http::HeaderMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::audit::{
    AuditConfig, AuditLogger, AuditSink, AuditSinkKind, AuditWorker, PgAuditSink,
    TracingAuditSink,
};
use crate::auth::{
    ApiKeyRegistry, AuthConfig, ContextResolver, InMemoryUserDirectory, PgUserDirectory,
    UserDirectory,
};
use crate::config::{Config, StoreBackend};
use crate::error::{ErrorCode, GuardError, Result};
use crate::rbac::evaluator::DEFAULT_OWNERSHIP_TIMEOUT;
use crate::rbac::{
    default_policy, AccessContext, AccessDecision, Action, InMemoryRelationStore,
    OwnershipResolver, PgRelationStore, PolicyConfig, PolicyEvaluator,
    PolicySnapshot, PolicyStore, PredicateExpr, PredicateFilterGenerator, RelationStore,
    ResourceRef, ResourceType,
};
use crate::seed::SeedData;

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

pub struct AuthorizationEngine {
    policies: Arc<PolicyStore>,
    resolver: Arc<ContextResolver>,
    evaluator: PolicyEvaluator,
    filters: PredicateFilterGenerator,
    audit: AuditLogger,
    policy_path: Option<PathBuf>,
}

impl std::fmt::Debug for AuthorizationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationEngine")
            .field("policy_version", &self.policies.version())
            .field("policy_path", &self.policy_path)
            .field("audit_pending", &self.audit.pending())
            .finish()
    }
}

impl AuthorizationEngine {
    pub fn builder(policies: Arc<PolicyStore>) -> EngineBuilder {
        EngineBuilder::new(policies)
    }

    /// Resolve request headers into an access context.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<AccessContext> {
        Ok(self.resolver.resolve_headers(headers).await?)
    }

    /// Decide and record the decision in the audit trail.
    ///
    /// Audit back-pressure never changes the decision.
    #[instrument(
        skip(self, ctx, resource),
        fields(
            tenant_id = %ctx.tenant_id,
            user_id = %ctx.user_id,
            action = %action,
            resource_type = %resource.resource_type,
        )
    )]
    pub async fn authorize(
        &self,
        ctx: &AccessContext,
        action: Action,
        resource: &ResourceRef,
    ) -> AccessDecision {
        let decision = self.evaluator.evaluate(ctx, action, resource).await;
        if let Err(e) = self.audit.record(&decision) {
            debug!(error = %e, "Decision not queued for audit");
        }
        decision
    }

    /// Read filter for a list query on `resource_type`.
    pub fn filter_for(&self, ctx: &AccessContext, resource_type: ResourceType) -> PredicateExpr {
        self.filters.filter_for(ctx, resource_type)
    }

    pub fn filter_for_name(&self, ctx: &AccessContext, resource_type: &str) -> PredicateExpr {
        self.filters.filter_for_name(ctx, resource_type)
    }

    /// Validate and activate a pushed policy.
    pub fn reload_policy(&self, config: &PolicyConfig) -> Result<Arc<PolicySnapshot>> {
        Ok(self.policies.reload(config)?)
    }

    /// Re-read the configured policy file.
    pub fn reload_from_source(&self) -> Result<Arc<PolicySnapshot>> {
        let path = self.policy_path.as_ref().ok_or_else(|| {
            GuardError::new(
                ErrorCode::MissingConfiguration,
                "No policy file is configured",
            )
        })?;
        Ok(self.policies.reload_from_path(path)?)
    }

    pub fn policy_version(&self) -> u64 {
        self.policies.version()
    }

    pub fn policy(&self) -> Arc<PolicySnapshot> {
        self.policies.snapshot()
    }

    pub fn policy_path(&self) -> Option<&PathBuf> {
        self.policy_path.as_ref()
    }

    pub fn resolver(&self) -> &Arc<ContextResolver> {
        &self.resolver
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

pub struct EngineBuilder {
    policies: Arc<PolicyStore>,
    relations: Option<Arc<dyn RelationStore>>,
    directory: Option<Arc<dyn UserDirectory>>,
    api_keys: Option<Arc<ApiKeyRegistry>>,
    auth: AuthConfig,
    ownership_timeout: Duration,
    audit_sink: Option<Arc<dyn AuditSink>>,
    audit_config: AuditConfig,
    policy_path: Option<PathBuf>,
}

impl EngineBuilder {
    pub fn new(policies: Arc<PolicyStore>) -> Self {
        Self {
            policies,
            relations: None,
            directory: None,
            api_keys: None,
            auth: AuthConfig::default(),
            ownership_timeout: DEFAULT_OWNERSHIP_TIMEOUT,
            audit_sink: None,
            audit_config: AuditConfig::default(),
            policy_path: None,
        }
    }

    pub fn relations(mut self, store: Arc<dyn RelationStore>) -> Self {
        self.relations = Some(store);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn api_keys(mut self, registry: Arc<ApiKeyRegistry>) -> Self {
        self.api_keys = Some(registry);
        self
    }

    pub fn auth(mut self, config: AuthConfig) -> Self {
        self.auth = config;
        self
    }

    pub fn ownership_timeout(mut self, timeout: Duration) -> Self {
        self.ownership_timeout = timeout;
        self
    }

    pub fn audit(mut self, sink: Arc<dyn AuditSink>, config: AuditConfig) -> Self {
        self.audit_sink = Some(sink);
        self.audit_config = config;
        self
    }

    pub fn policy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_path = Some(path.into());
        self
    }

    /// Build the engine and start the audit worker on the current runtime.
    ///
    /// Unset parts default to empty in-memory stores and the log sink.
    pub fn build(self) -> Result<(AuthorizationEngine, AuditWorker)> {
        let relations: Arc<dyn RelationStore> = match self.relations {
            Some(store) => store,
            None => Arc::new(InMemoryRelationStore::new()),
        };
        let directory: Arc<dyn UserDirectory> = match self.directory {
            Some(directory) => directory,
            None => Arc::new(InMemoryUserDirectory::new()),
        };
        let api_keys = match self.api_keys {
            Some(registry) => registry,
            None => Arc::new(ApiKeyRegistry::new()),
        };
        for entry in &self.auth.api_keys {
            api_keys.register(entry.clone());
        }

        let resolver = Arc::new(ContextResolver::new(self.auth, directory, api_keys)?);
        let evaluator = PolicyEvaluator::new(self.policies.clone(), OwnershipResolver::new(relations))
            .with_ownership_timeout(self.ownership_timeout);
        let filters = PredicateFilterGenerator::new(self.policies.clone());

        let sink: Arc<dyn AuditSink> = match self.audit_sink {
            Some(sink) => sink,
            None => Arc::new(TracingAuditSink),
        };
        let (audit, worker) = AuditLogger::spawn(sink, self.audit_config);

        Ok((
            AuthorizationEngine {
                policies: self.policies,
                resolver,
                evaluator,
                filters,
                audit,
                policy_path: self.policy_path,
            },
            worker,
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bootstrap
// ═══════════════════════════════════════════════════════════════════════════════

/// Build the engine described by `config`: load the policy, connect and
/// migrate the database when a Postgres backend is selected, and seed the
/// in-memory stores.
pub async fn bootstrap(config: &Config) -> Result<(AuthorizationEngine, AuditWorker)> {
    config.validate()?;

    let policy = match &config.policy.path {
        Some(path) => PolicyConfig::from_path(path)?,
        None => default_policy(),
    };
    let policies = Arc::new(PolicyStore::from_config(&policy)?);
    info!(
        version = policies.version(),
        source = config
            .policy
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in".to_string()),
        "Policy loaded"
    );

    let pool = if config.needs_database() {
        Some(connect(config).await?)
    } else {
        None
    };

    let mut builder = EngineBuilder::new(policies)
        .auth(config.auth.clone())
        .ownership_timeout(config.ownership.timeout);
    if let Some(path) = &config.policy.path {
        builder = builder.policy_path(path.clone());
    }

    let seed = match &config.ownership.seed_path {
        Some(path) => SeedData::from_path(path)?,
        None => SeedData::default(),
    };
    let api_keys = Arc::new(ApiKeyRegistry::new());
    seed.apply_api_keys(&api_keys);
    builder = builder.api_keys(api_keys);

    builder = match (config.ownership.backend, &pool) {
        (StoreBackend::Postgres, Some(pool)) => builder
            .relations(Arc::new(PgRelationStore::new(pool.clone())))
            .directory(Arc::new(PgUserDirectory::new(pool.clone()))),
        _ => {
            let relations = InMemoryRelationStore::new();
            seed.apply_relations(&relations);
            let directory = InMemoryUserDirectory::new();
            seed.apply_users(&directory);
            info!(
                users = directory.len(),
                relations = seed.relations.len(),
                "In-memory stores seeded"
            );
            builder
                .relations(Arc::new(relations))
                .directory(Arc::new(directory))
        }
    };

    let sink: Arc<dyn AuditSink> = match (config.audit.sink, &pool) {
        (AuditSinkKind::Postgres, Some(pool)) => Arc::new(PgAuditSink::new(pool.clone())),
        _ => Arc::new(TracingAuditSink),
    };

    builder.audit(sink, config.audit.clone()).build()
}

async fn connect(config: &Config) -> Result<PgPool> {
    let url = config.database.url.as_deref().ok_or_else(|| {
        GuardError::new(ErrorCode::MissingConfiguration, "database.url is not set")
    })?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(config.database.acquire_timeout)
        .connect(url)
        .await?;
    info!(max_connections = config.database.max_connections, "Connected to database");

    if config.database.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database migrations applied");
    }

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::auth::Claims;
    use crate::rbac::{ReasonCode, Role, User};
    use chrono::{Duration as ChronoDuration, Utc};

    fn context(tenant: &str, user: &str, role: Role) -> AccessContext {
        AccessContext::new(tenant, user, role, Utc::now() + ChronoDuration::minutes(5))
    }

    #[tokio::test]
    async fn test_authorize_records_audit() {
        let sink = Arc::new(MemoryAuditSink::new());
        let config = AuditConfig {
            flush_interval: Duration::from_millis(5),
            ..AuditConfig::default()
        };
        let (engine, worker) = AuthorizationEngine::builder(Arc::new(PolicyStore::with_defaults().unwrap()))
            .audit(sink.clone(), config)
            .build()
            .unwrap();

        let ctx = context("t1", "owner-1", Role::Owner);
        let decision = engine
            .authorize(&ctx, Action::Delete, &ResourceRef::new("t2", ResourceType::Invoice, "inv-1"))
            .await;
        assert_eq!(decision.reason_code(), ReasonCode::CrossTenantAccess);

        drop(engine);
        worker.drained().await;

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].allowed);
        assert_eq!(records[0].resource_tenant_id.as_str(), "t2");
    }

    #[tokio::test]
    async fn test_resolve_through_engine() {
        let directory = Arc::new(InMemoryUserDirectory::with_users([User::new(
            "u1",
            "t1",
            Role::Manager,
        )]));
        let (engine, _worker) = AuthorizationEngine::builder(Arc::new(PolicyStore::with_defaults().unwrap()))
            .auth(AuthConfig::with_secret("engine-secret"))
            .directory(directory)
            .build()
            .unwrap();

        let token = engine
            .resolver()
            .issue_token(&Claims::builder("u1", "t1").build())
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );

        let ctx = engine.resolve(&headers).await.unwrap();
        assert_eq!(ctx.tenant_id.as_str(), "t1");
        assert_eq!(ctx.role, Role::Manager);

        let err = engine.resolve(&HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingCredential);
    }

    #[tokio::test]
    async fn test_reload_without_path() {
        let (engine, _worker) = AuthorizationEngine::builder(Arc::new(PolicyStore::with_defaults().unwrap()))
            .build()
            .unwrap();
        let err = engine.reload_from_source().unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);

        let mut next = default_policy();
        next.version = engine.policy_version() + 1;
        engine.reload_policy(&next).unwrap();
        assert_eq!(engine.policy_version(), next.version);

        let err = engine.reload_policy(&next).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StalePolicyVersion);
    }

    #[tokio::test]
    async fn test_bootstrap_defaults() {
        let (engine, _worker) = bootstrap(&Config::default()).await.unwrap();
        assert_eq!(engine.policy_version(), crate::rbac::roles::DEFAULT_POLICY_VERSION);
        assert!(engine.policy_path().is_none());
    }
}
