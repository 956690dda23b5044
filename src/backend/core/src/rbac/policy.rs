//! Policy model: the versioned `(role, resource_type, action) -> scope` table,
//! its loader, and the store that swaps snapshots atomically.
//!
//! A snapshot is immutable once built. Reloading never patches the live
//! snapshot; it validates a complete config into a new one and swaps the
//! pointer, so an evaluation that captured the old snapshot finishes against it.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use super::models::{Action, Permission, ResourceRef, ResourceType, Role, Scope};

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// A policy config that cannot be activated.
#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("Policy version must be greater than zero")]
    ZeroVersion,

    #[error("Duplicate rule for role={role}, resource_type={resource_type}, action={action}")]
    DuplicateRule {
        role: Role,
        resource_type: ResourceType,
        action: Action,
    },

    #[error("Escalation guard for role {0} names no protected role")]
    EmptyEscalationGuard(Role),

    #[error("Escalation guard for role {0} cannot guard reads")]
    GuardedRead(Role),

    #[error("Unknown resource type in field allow-lists: {0}")]
    UnknownResourceType(String),

    #[error("Field allow-list for {0} contains an empty field name")]
    EmptyFieldName(ResourceType),

    #[error("Policy version {offered} is not newer than live version {live}")]
    StaleVersion { offered: u64, live: u64 },

    #[error("Failed to parse policy: {0}")]
    Parse(String),

    #[error("Failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PolicyLoadError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ZeroVersion => "zero_version",
            Self::DuplicateRule { .. } => "duplicate_rule",
            Self::EmptyEscalationGuard(_) => "empty_guard",
            Self::GuardedRead(_) => "guarded_read",
            Self::UnknownResourceType(_) => "unknown_resource_type",
            Self::EmptyFieldName(_) => "empty_field_name",
            Self::StaleVersion { .. } => "stale_version",
            Self::Parse(_) => "parse",
            Self::Io { .. } => "io",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Config Format
// ═══════════════════════════════════════════════════════════════════════════════

/// One explicit cell of the policy matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    pub role: Role,
    pub resource_type: ResourceType,
    pub action: Action,
    pub scope: Scope,
}

impl PolicyRule {
    pub fn new(role: Role, resource_type: ResourceType, action: Action, scope: Scope) -> Self {
        Self {
            role,
            resource_type,
            action,
            scope,
        }
    }
}

/// Forbids `actor_role` from writing `User` records that hold, or would hold,
/// one of `protected_roles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationGuard {
    pub actor_role: Role,
    pub protected_roles: Vec<Role>,
    #[serde(default = "default_guarded_actions")]
    pub actions: Vec<Action>,
}

fn default_guarded_actions() -> Vec<Action> {
    vec![Action::Create, Action::Update, Action::Delete]
}

impl EscalationGuard {
    pub fn new(actor_role: Role, protected_roles: Vec<Role>) -> Self {
        Self {
            actor_role,
            protected_roles,
            actions: default_guarded_actions(),
        }
    }

    fn applies_to(&self, role: Role, action: Action) -> bool {
        self.actor_role == role && self.actions.contains(&action)
    }
}

/// Serialized policy, as read from TOML/JSON or pushed to the reload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub version: u64,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub escalation_guards: Vec<EscalationGuard>,
    /// Fields an `ApiPartner` may see, keyed by resource type wire name.
    #[serde(default)]
    pub field_allowlists: BTreeMap<String, Vec<String>>,
}

impl PolicyConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, PolicyLoadError> {
        toml::from_str(input).map_err(|e| PolicyLoadError::Parse(e.to_string()))
    }

    pub fn from_json_str(input: &str) -> Result<Self, PolicyLoadError> {
        serde_json::from_str(input).map_err(|e| PolicyLoadError::Parse(e.to_string()))
    }

    /// Read a policy file. `.json` files parse as JSON, anything else as TOML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyLoadError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        }
    }

    pub fn to_toml_string(&self) -> Result<String, PolicyLoadError> {
        toml::to_string_pretty(self).map_err(|e| PolicyLoadError::Parse(e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// An immutable, fully resolved policy version.
///
/// Every `(role, resource_type, action)` of the catalog resolves to exactly
/// one scope. Combinations the config does not mention resolve to
/// [`Scope::None`].
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    version: u64,
    table: HashMap<(Role, ResourceType, Action), Scope>,
    escalation_guards: Vec<EscalationGuard>,
    field_allowlists: HashMap<ResourceType, Vec<String>>,
    explicit_rules: usize,
    loaded_at: DateTime<Utc>,
}

impl PolicySnapshot {
    /// Validate `config` into a snapshot. Fails atomically.
    pub fn load(config: &PolicyConfig) -> Result<Self, PolicyLoadError> {
        if config.version == 0 {
            return Err(PolicyLoadError::ZeroVersion);
        }

        let mut table = HashMap::with_capacity(
            Role::ALL.len() * ResourceType::ALL.len() * Action::ALL.len(),
        );
        for role in Role::ALL {
            for resource_type in ResourceType::ALL {
                for action in Action::ALL {
                    table.insert((*role, *resource_type, *action), Scope::None);
                }
            }
        }

        let mut seen = HashSet::with_capacity(config.rules.len());
        for rule in &config.rules {
            let key = (rule.role, rule.resource_type, rule.action);
            if !seen.insert(key) {
                return Err(PolicyLoadError::DuplicateRule {
                    role: rule.role,
                    resource_type: rule.resource_type,
                    action: rule.action,
                });
            }
            table.insert(key, rule.scope);
        }

        for guard in &config.escalation_guards {
            if guard.protected_roles.is_empty() {
                return Err(PolicyLoadError::EmptyEscalationGuard(guard.actor_role));
            }
            // Read filters cannot see target roles, so a guarded read would
            // make list filters disagree with single-record decisions.
            if guard.actions.contains(&Action::Read) {
                return Err(PolicyLoadError::GuardedRead(guard.actor_role));
            }
        }

        let mut field_allowlists = HashMap::with_capacity(config.field_allowlists.len());
        for (name, fields) in &config.field_allowlists {
            let resource_type: ResourceType = name
                .parse()
                .map_err(|_| PolicyLoadError::UnknownResourceType(name.clone()))?;
            if fields.iter().any(|f| f.trim().is_empty()) {
                return Err(PolicyLoadError::EmptyFieldName(resource_type));
            }
            field_allowlists.insert(resource_type, fields.clone());
        }

        Ok(Self {
            version: config.version,
            table,
            escalation_guards: config.escalation_guards.clone(),
            field_allowlists,
            explicit_rules: config.rules.len(),
            loaded_at: Utc::now(),
        })
    }

    /// Resolve one cell of the matrix. Total over the catalog.
    pub fn lookup(&self, role: Role, resource_type: ResourceType, action: Action) -> Permission {
        let scope = self
            .table
            .get(&(role, resource_type, action))
            .copied()
            .unwrap_or(Scope::None);

        Permission {
            role,
            resource_type,
            action,
            scope,
        }
    }

    /// Whether a write by `role` on a `User` record crosses an escalation guard.
    ///
    /// A guarded create or update without a `target_role`, or a guarded delete
    /// naming no role at all, is treated as crossing the guard.
    pub fn violates_escalation_guard(
        &self,
        role: Role,
        action: Action,
        resource: &ResourceRef,
    ) -> bool {
        if resource.resource_type != ResourceType::User {
            return false;
        }

        let role_unknown = match action {
            Action::Create | Action::Update => resource.target_role.is_none(),
            _ => resource.target_role.is_none() && resource.current_role.is_none(),
        };

        self.escalation_guards
            .iter()
            .filter(|guard| guard.applies_to(role, action))
            .any(|guard| {
                role_unknown
                    || resource
                        .target_role
                        .iter()
                        .chain(resource.current_role.iter())
                        .any(|r| guard.protected_roles.contains(r))
            })
    }

    /// Fields visible to an `ApiPartner` on this resource type. Empty when none
    /// are configured.
    pub fn field_allowlist(&self, resource_type: ResourceType) -> Vec<String> {
        self.field_allowlists
            .get(&resource_type)
            .cloned()
            .unwrap_or_default()
    }

    /// The full resolved matrix, ordered by role, resource type and action.
    pub fn permissions(&self) -> Vec<Permission> {
        let mut out = Vec::with_capacity(self.table.len());
        for role in Role::ALL {
            for resource_type in ResourceType::ALL {
                for action in Action::ALL {
                    out.push(self.lookup(*role, *resource_type, *action));
                }
            }
        }
        out
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rule_count(&self) -> usize {
        self.explicit_rules
    }

    pub fn escalation_guards(&self) -> &[EscalationGuard] {
        &self.escalation_guards
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Holder of the live snapshot.
///
/// The write lock is held only for the pointer swap; readers clone the `Arc`
/// and release the lock immediately.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        gauge!("tenantguard_policy_version").set(snapshot.version() as f64);
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyLoadError> {
        Ok(Self::new(PolicySnapshot::load(config)?))
    }

    /// Store seeded with the built-in product policy.
    pub fn with_defaults() -> Result<Self, PolicyLoadError> {
        Self::from_config(&super::roles::default_policy())
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    /// Validate and activate a new config. On any error the live snapshot is
    /// left untouched.
    pub fn reload(&self, config: &PolicyConfig) -> Result<Arc<PolicySnapshot>, PolicyLoadError> {
        let result = PolicySnapshot::load(config).and_then(|snapshot| {
            let snapshot = Arc::new(snapshot);
            let mut current = self.current.write();
            if snapshot.version() <= current.version() {
                return Err(PolicyLoadError::StaleVersion {
                    offered: snapshot.version(),
                    live: current.version(),
                });
            }
            *current = snapshot.clone();
            Ok(snapshot)
        });

        match &result {
            Ok(snapshot) => {
                counter!("tenantguard_policy_reloads_total", "outcome" => "success").increment(1);
                gauge!("tenantguard_policy_version").set(snapshot.version() as f64);
                info!(
                    version = snapshot.version(),
                    rules = snapshot.rule_count(),
                    "Policy snapshot activated"
                );
            }
            Err(e) => {
                counter!("tenantguard_policy_reloads_total", "outcome" => "rejected").increment(1);
                error!(error = %e, kind = e.kind(), live_version = self.version(), "Policy reload rejected");
            }
        }

        result
    }

    pub fn reload_from_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Arc<PolicySnapshot>, PolicyLoadError> {
        let config = PolicyConfig::from_path(path).inspect_err(|e| {
            counter!("tenantguard_policy_reloads_total", "outcome" => "rejected").increment(1);
            error!(error = %e, "Policy file could not be read");
        })?;
        self.reload(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(version: u64) -> PolicyConfig {
        PolicyConfig {
            version,
            rules: vec![PolicyRule::new(
                Role::Staff,
                ResourceType::Job,
                Action::Update,
                Scope::AssignedOnly,
            )],
            escalation_guards: vec![],
            field_allowlists: BTreeMap::new(),
        }
    }

    #[test]
    fn test_absent_combination_resolves_to_none() {
        let snapshot = PolicySnapshot::load(&minimal(1)).unwrap();
        let p = snapshot.lookup(Role::Owner, ResourceType::Invoice, Action::Delete);
        assert_eq!(p.scope, Scope::None);
        assert!(!p.is_granted());

        let p = snapshot.lookup(Role::Staff, ResourceType::Job, Action::Update);
        assert_eq!(p.scope, Scope::AssignedOnly);
    }

    #[test]
    fn test_matrix_is_total() {
        let snapshot = PolicySnapshot::load(&minimal(1)).unwrap();
        assert_eq!(snapshot.permissions().len(), 5 * 6 * 4);
    }

    #[test]
    fn test_zero_version_rejected() {
        assert!(matches!(
            PolicySnapshot::load(&minimal(0)),
            Err(PolicyLoadError::ZeroVersion)
        ));
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let mut config = minimal(1);
        config.rules.push(PolicyRule::new(
            Role::Staff,
            ResourceType::Job,
            Action::Update,
            Scope::All,
        ));
        assert!(matches!(
            PolicySnapshot::load(&config),
            Err(PolicyLoadError::DuplicateRule { .. })
        ));
    }

    #[test]
    fn test_guard_validation() {
        let mut config = minimal(1);
        config.escalation_guards.push(EscalationGuard::new(Role::Manager, vec![]));
        assert!(matches!(
            PolicySnapshot::load(&config),
            Err(PolicyLoadError::EmptyEscalationGuard(Role::Manager))
        ));

        let mut config = minimal(1);
        config.escalation_guards.push(EscalationGuard {
            actor_role: Role::Manager,
            protected_roles: vec![Role::Owner],
            actions: vec![Action::Read],
        });
        assert!(matches!(
            PolicySnapshot::load(&config),
            Err(PolicyLoadError::GuardedRead(Role::Manager))
        ));
    }

    #[test]
    fn test_allowlist_validation() {
        let mut config = minimal(1);
        config
            .field_allowlists
            .insert("customer".into(), vec!["id".into(), " ".into()]);
        assert!(matches!(
            PolicySnapshot::load(&config),
            Err(PolicyLoadError::EmptyFieldName(ResourceType::Customer))
        ));

        let mut config = minimal(1);
        config.field_allowlists.insert("ticket".into(), vec!["id".into()]);
        assert!(matches!(
            PolicySnapshot::load(&config),
            Err(PolicyLoadError::UnknownResourceType(_))
        ));
    }

    #[test]
    fn test_unknown_names_fail_parse() {
        let raw = r#"
            version = 2
            [[rules]]
            role = "superuser"
            resource_type = "job"
            action = "read"
            scope = "all"
        "#;
        assert!(matches!(
            PolicyConfig::from_toml_str(raw),
            Err(PolicyLoadError::Parse(_))
        ));

        let raw = r#"{"version": 2, "rules": [{"role": "staff", "resource_type": "job", "action": "approve", "scope": "all"}]}"#;
        assert!(matches!(
            PolicyConfig::from_json_str(raw),
            Err(PolicyLoadError::Parse(_))
        ));
    }

    #[test]
    fn test_reload_requires_newer_version() {
        let store = PolicyStore::from_config(&minimal(3)).unwrap();

        let err = store.reload(&minimal(3)).unwrap_err();
        assert!(matches!(err, PolicyLoadError::StaleVersion { offered: 3, live: 3 }));
        assert_eq!(store.version(), 3);

        store.reload(&minimal(4)).unwrap();
        assert_eq!(store.version(), 4);
    }

    #[test]
    fn test_failed_reload_keeps_live_snapshot() {
        let store = PolicyStore::from_config(&minimal(1)).unwrap();
        let before = store.snapshot();

        let mut bad = minimal(2);
        bad.escalation_guards.push(EscalationGuard::new(Role::Manager, vec![]));
        assert!(store.reload(&bad).is_err());

        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[test]
    fn test_captured_snapshot_survives_swap() {
        let store = PolicyStore::from_config(&minimal(1)).unwrap();
        let captured = store.snapshot();
        store.reload(&minimal(2)).unwrap();

        assert_eq!(captured.version(), 1);
        assert_eq!(store.snapshot().version(), 2);
    }
}
