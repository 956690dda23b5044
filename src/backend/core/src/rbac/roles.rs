//! Built-in product policy.
//!
//! Used when no policy file is configured:
//!
//! | Resource   | Owner | Manager | Staff          | Viewer | ApiPartner  |
//! |------------|-------|---------|----------------|--------|-------------|
//! | customer   | CRUD  | CRUD    | R,U assigned   | R      | R assigned  |
//! | job        | CRUD  | CRUD    | R,U assigned   | R      | R assigned  |
//! | invoice    | CRUD  | CRUD    | C,R,U owned    | R      | -           |
//! | order      | CRUD  | CRUD    | C,R,U owned    | R      | C,R owned   |
//! | pos_ticket | CRUD  | CRUD    | C,R,U owned    | R      | -           |
//! | user       | CRUD  | CRUD*   | R owned        | -      | -           |
//!
//! `*` Manager may not create, update or delete an Owner.

use std::collections::BTreeMap;

use super::models::{Action, ResourceType, Role, Scope};
use super::policy::{EscalationGuard, PolicyConfig, PolicyRule};

/// Version stamped on the built-in policy.
pub const DEFAULT_POLICY_VERSION: u64 = 1;

impl Role {
    pub fn description(&self) -> &'static str {
        match self {
            Role::Owner => "Full control of the tenant, including user administration",
            Role::Manager => "Runs daily operations; cannot administer owners",
            Role::Staff => "Works on assigned jobs and records they author",
            Role::Viewer => "Read-only access to business records",
            Role::ApiPartner => "External integration restricted to assigned records",
        }
    }

    /// Grants this role receives in the built-in policy.
    pub fn default_grants(&self) -> Vec<(ResourceType, Action, Scope)> {
        use Action::*;
        use ResourceType::*;

        let every = |scope: Scope, types: &[ResourceType], actions: &[Action]| {
            types
                .iter()
                .flat_map(|t| actions.iter().map(move |a| (*t, *a, scope)))
                .collect::<Vec<_>>()
        };

        match self {
            Role::Owner | Role::Manager => every(Scope::All, ResourceType::ALL, Action::ALL),
            Role::Staff => {
                let mut grants = every(Scope::AssignedOnly, &[Customer, Job], &[Read, Update]);
                grants.extend(every(
                    Scope::OwnedOnly,
                    &[Invoice, Order, PosTicket],
                    &[Create, Read, Update],
                ));
                grants.extend(every(Scope::OwnedOnly, &[User], &[Read]));
                grants
            }
            Role::Viewer => every(
                Scope::All,
                &[Customer, Job, Invoice, Order, PosTicket],
                &[Read],
            ),
            Role::ApiPartner => {
                let mut grants = every(Scope::AssignedOnly, &[Customer, Job], &[Read]);
                grants.extend(every(Scope::OwnedOnly, &[Order], &[Create, Read]));
                grants
            }
        }
    }
}

/// Guards shipped with the built-in policy.
pub fn default_escalation_guards() -> Vec<EscalationGuard> {
    vec![EscalationGuard::new(Role::Manager, vec![Role::Owner])]
}

/// Partner-visible fields. Billing and internal-note fields are left out.
pub fn default_field_allowlists() -> BTreeMap<String, Vec<String>> {
    let mut lists = BTreeMap::new();
    lists.insert(
        ResourceType::Customer.to_string(),
        fields(&["id", "name", "email", "phone", "service_address"]),
    );
    lists.insert(
        ResourceType::Job.to_string(),
        fields(&["id", "customer_id", "status", "scheduled_for", "service_address", "description"]),
    );
    lists.insert(
        ResourceType::Order.to_string(),
        fields(&["id", "customer_id", "status", "line_items", "created_at"]),
    );
    lists
}

fn fields(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// The built-in policy as a config document.
pub fn default_policy() -> PolicyConfig {
    let rules = Role::ALL
        .iter()
        .flat_map(|role| {
            role.default_grants()
                .into_iter()
                .map(move |(resource_type, action, scope)| {
                    PolicyRule::new(*role, resource_type, action, scope)
                })
        })
        .collect();

    PolicyConfig {
        version: DEFAULT_POLICY_VERSION,
        rules,
        escalation_guards: default_escalation_guards(),
        field_allowlists: default_field_allowlists(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::policy::PolicySnapshot;

    #[test]
    fn test_default_policy_loads() {
        let snapshot = PolicySnapshot::load(&default_policy()).unwrap();
        assert_eq!(snapshot.version(), DEFAULT_POLICY_VERSION);
        assert_eq!(snapshot.escalation_guards().len(), 1);
    }

    #[test]
    fn test_default_matrix_cells() {
        let s = PolicySnapshot::load(&default_policy()).unwrap();

        assert_eq!(s.lookup(Role::Owner, ResourceType::User, Action::Delete).scope, Scope::All);
        assert_eq!(
            s.lookup(Role::Staff, ResourceType::Job, Action::Update).scope,
            Scope::AssignedOnly
        );
        assert_eq!(s.lookup(Role::Staff, ResourceType::Job, Action::Delete).scope, Scope::None);
        assert_eq!(
            s.lookup(Role::Staff, ResourceType::Invoice, Action::Create).scope,
            Scope::OwnedOnly
        );
        assert_eq!(s.lookup(Role::Viewer, ResourceType::User, Action::Read).scope, Scope::None);
        assert_eq!(
            s.lookup(Role::ApiPartner, ResourceType::Order, Action::Create).scope,
            Scope::OwnedOnly
        );
        assert_eq!(
            s.lookup(Role::ApiPartner, ResourceType::Invoice, Action::Read).scope,
            Scope::None
        );
    }

    #[test]
    fn test_partner_allowlist_excludes_billing() {
        let s = PolicySnapshot::load(&default_policy()).unwrap();
        let fields = s.field_allowlist(ResourceType::Customer);
        assert!(fields.contains(&"email".to_string()));
        assert!(!fields.iter().any(|f| f.contains("billing") || f.contains("note")));
    }

    #[test]
    fn test_default_policy_round_trips_through_toml() {
        let raw = default_policy().to_toml_string().unwrap();
        let parsed = PolicyConfig::from_toml_str(&raw).unwrap();
        assert_eq!(parsed, default_policy());
    }
}
