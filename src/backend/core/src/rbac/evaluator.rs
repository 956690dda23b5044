//! Policy evaluator: context + action + resource reference -> decision.
//!
//! Checks run in a fixed order and the first match wins:
//!
//! 1. tenant check
//! 2. privilege-escalation guard
//! 3. role lookup
//! 4. scope resolution (with ownership lookups under a time budget)
//!
//! Every path yields exactly one [`ReasonCode`]. Anything the evaluator cannot
//! establish resolves to a denial.

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::filter;
use super::filter::PredicateExpr;
use super::models::{AccessContext, Action, ResourceRef, ResourceType, Role, Scope};
use super::ownership::{OwnershipError, OwnershipResolver};
use super::policy::{PolicySnapshot, PolicyStore};

/// Default budget for a single ownership lookup.
pub const DEFAULT_OWNERSHIP_TIMEOUT: Duration = Duration::from_millis(100);

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    CrossTenantAccess,
    PrivilegeEscalation,
    RoleForbidden,
    RoleFullAccess,
    OwnerMatch,
    NotOwner,
    AssignmentMatch,
    NotAssigned,
    OwnershipCheckTimeout,
    OwnershipCheckFailed,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrossTenantAccess => "cross_tenant_access",
            Self::PrivilegeEscalation => "privilege_escalation",
            Self::RoleForbidden => "role_forbidden",
            Self::RoleFullAccess => "role_full_access",
            Self::OwnerMatch => "owner_match",
            Self::NotOwner => "not_owner",
            Self::AssignmentMatch => "assignment_match",
            Self::NotAssigned => "not_assigned",
            Self::OwnershipCheckTimeout => "ownership_check_timeout",
            Self::OwnershipCheckFailed => "ownership_check_failed",
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(
            self,
            Self::RoleFullAccess | Self::OwnerMatch | Self::AssignmentMatch
        )
    }

    /// Product-facing result code.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::RoleFullAccess | Self::OwnerMatch | Self::AssignmentMatch => ResultCode::Allowed,
            Self::CrossTenantAccess => ResultCode::RlsViolationError,
            Self::RoleForbidden | Self::PrivilegeEscalation => ResultCode::PermissionDenied,
            Self::NotOwner
            | Self::NotAssigned
            | Self::OwnershipCheckTimeout
            | Self::OwnershipCheckFailed => ResultCode::UnauthorizedResource,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vocabulary the product surfaces to its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Allowed,
    RlsViolationError,
    PermissionDenied,
    UnauthorizedResource,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "ALLOWED",
            Self::RlsViolationError => "RLS_VIOLATION_ERROR",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::UnauthorizedResource => "UNAUTHORIZED_RESOURCE",
        }
    }
}

/// Outcome of one evaluation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    allowed: bool,
    reason_code: ReasonCode,
    action: Action,
    evaluated_at: DateTime<Utc>,
    context: AccessContext,
    resource_ref: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field_allowlist: Option<Vec<String>>,
    policy_version: u64,
}

impl AccessDecision {
    fn new(
        reason_code: ReasonCode,
        action: Action,
        context: &AccessContext,
        resource_ref: &ResourceRef,
        field_allowlist: Option<Vec<String>>,
        policy_version: u64,
    ) -> Self {
        Self {
            allowed: reason_code.is_allow(),
            reason_code,
            action,
            evaluated_at: Utc::now(),
            context: context.clone(),
            resource_ref: resource_ref.clone(),
            field_allowlist,
            policy_version,
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn reason_code(&self) -> ReasonCode {
        self.reason_code
    }

    pub fn result_code(&self) -> ResultCode {
        self.reason_code.result_code()
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn evaluated_at(&self) -> DateTime<Utc> {
        self.evaluated_at
    }

    pub fn context(&self) -> &AccessContext {
        &self.context
    }

    pub fn resource_ref(&self) -> &ResourceRef {
        &self.resource_ref
    }

    pub fn field_allowlist(&self) -> Option<&[String]> {
        self.field_allowlist.as_deref()
    }

    pub fn policy_version(&self) -> u64 {
        self.policy_version
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Evaluator
// ═══════════════════════════════════════════════════════════════════════════════

/// The decision function. Cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct PolicyEvaluator {
    policies: Arc<PolicyStore>,
    ownership: OwnershipResolver,
    ownership_timeout: Duration,
}

impl PolicyEvaluator {
    pub fn new(policies: Arc<PolicyStore>, ownership: OwnershipResolver) -> Self {
        Self {
            policies,
            ownership,
            ownership_timeout: DEFAULT_OWNERSHIP_TIMEOUT,
        }
    }

    pub fn with_ownership_timeout(mut self, timeout: Duration) -> Self {
        self.ownership_timeout = timeout;
        self
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// Decide against the live snapshot.
    pub async fn evaluate(
        &self,
        ctx: &AccessContext,
        action: Action,
        resource: &ResourceRef,
    ) -> AccessDecision {
        let snapshot = self.policies.snapshot();
        self.evaluate_with(&snapshot, ctx, action, resource).await
    }

    /// Decide against a captured snapshot. Lets a caller run several checks
    /// against one policy version.
    pub async fn evaluate_with(
        &self,
        snapshot: &PolicySnapshot,
        ctx: &AccessContext,
        action: Action,
        resource: &ResourceRef,
    ) -> AccessDecision {
        let start = Instant::now();
        let reason = self.decide(snapshot, ctx, action, resource).await;

        let field_allowlist = (reason.is_allow() && ctx.role == Role::ApiPartner)
            .then(|| snapshot.field_allowlist(resource.resource_type));

        let decision = AccessDecision::new(
            reason,
            action,
            ctx,
            resource,
            field_allowlist,
            snapshot.version(),
        );

        let outcome = if decision.allowed() { "allow" } else { "deny" };
        counter!(
            "tenantguard_decisions_total",
            "decision" => outcome,
            "reason" => reason.as_str()
        )
        .increment(1);
        histogram!("tenantguard_evaluation_duration_seconds").record(start.elapsed().as_secs_f64());

        debug!(
            tenant_id = %ctx.tenant_id,
            user_id = %ctx.user_id,
            role = %ctx.role,
            action = %action,
            resource_type = %resource.resource_type,
            resource_id = %resource.resource_id,
            allowed = decision.allowed(),
            reason = %reason,
            policy_version = snapshot.version(),
            "Access evaluated"
        );

        decision
    }

    async fn decide(
        &self,
        snapshot: &PolicySnapshot,
        ctx: &AccessContext,
        action: Action,
        resource: &ResourceRef,
    ) -> ReasonCode {
        if ctx.tenant_id != resource.tenant_id {
            warn!(
                tenant_id = %ctx.tenant_id,
                resource_tenant_id = %resource.tenant_id,
                user_id = %ctx.user_id,
                resource_type = %resource.resource_type,
                "Cross-tenant access attempt denied"
            );
            return ReasonCode::CrossTenantAccess;
        }

        if snapshot.violates_escalation_guard(ctx.role, action, resource) {
            return ReasonCode::PrivilegeEscalation;
        }

        let permission = snapshot.lookup(ctx.role, resource.resource_type, action);
        match permission.scope {
            Scope::None => ReasonCode::RoleForbidden,
            Scope::All => ReasonCode::RoleFullAccess,
            Scope::OwnedOnly => {
                match self.bounded(self.ownership.is_owner(ctx, resource), resource).await {
                    Ok(true) => ReasonCode::OwnerMatch,
                    Ok(false) => ReasonCode::NotOwner,
                    Err(reason) => reason,
                }
            }
            Scope::AssignedOnly => {
                match self.bounded(self.ownership.is_assigned(ctx, resource), resource).await {
                    Ok(true) => ReasonCode::AssignmentMatch,
                    Ok(false) => ReasonCode::NotAssigned,
                    Err(reason) => reason,
                }
            }
        }
    }

    /// Run an ownership lookup under the time budget, mapping failure to the
    /// denial reason it produces.
    async fn bounded<F>(&self, lookup: F, resource: &ResourceRef) -> Result<bool, ReasonCode>
    where
        F: Future<Output = Result<bool, OwnershipError>>,
    {
        match tokio::time::timeout(self.ownership_timeout, lookup).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    resource_type = %resource.resource_type,
                    resource_id = %resource.resource_id,
                    "Ownership lookup failed; denying"
                );
                counter!("tenantguard_ownership_failures_total").increment(1);
                Err(ReasonCode::OwnershipCheckFailed)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.ownership_timeout.as_millis() as u64,
                    resource_type = %resource.resource_type,
                    resource_id = %resource.resource_id,
                    "Ownership lookup timed out; denying"
                );
                counter!("tenantguard_ownership_timeouts_total").increment(1);
                Err(ReasonCode::OwnershipCheckTimeout)
            }
        }
    }

    /// Read filter for `ctx`, consistent with [`evaluate`](Self::evaluate)
    /// for [`Action::Read`].
    pub fn filter_for(&self, ctx: &AccessContext, resource_type: ResourceType) -> PredicateExpr {
        filter::read_filter(&self.policies.snapshot(), ctx, resource_type)
    }
}
