//! Authorization data model: tenants, users, roles, actions, scopes and the
//! minimal resource projection the evaluator works on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque tenant identifier. The universal isolation boundary.
    TenantId
);

string_id!(
    /// Identifier of a user within its tenant.
    UserId
);

string_id!(
    /// Identifier of a business record (invoice, job, ...).
    ResourceId
);

// ═══════════════════════════════════════════════════════════════════════════════
// Enumerations
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned when a wire name does not belong to a closed enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseNameError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every member, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseNameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
                match normalized.as_str() {
                    $($wire => Ok($name::$variant),)+
                    _ => Err(ParseNameError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

wire_enum!(
    /// The five-tier role hierarchy. Closed: no runtime-defined roles.
    Role, "role" {
        Owner => "owner",
        Manager => "manager",
        Staff => "staff",
        Viewer => "viewer",
        ApiPartner => "api_partner",
    }
);

wire_enum!(
    /// CRUD action requested against a resource.
    Action, "action" {
        Create => "create",
        Read => "read",
        Update => "update",
        Delete => "delete",
    }
);

wire_enum!(
    /// Portion of a resource type's records a role may act on.
    Scope, "scope" {
        All => "all",
        OwnedOnly => "owned_only",
        AssignedOnly => "assigned_only",
        None => "none",
    }
);

wire_enum!(
    /// Closed catalog of business resource types.
    ResourceType, "resource type" {
        Customer => "customer",
        Job => "job",
        Invoice => "invoice",
        Order => "order",
        PosTicket => "pos_ticket",
        User => "user",
    }
);

impl Action {
    pub fn is_write(&self) -> bool {
        !matches!(self, Action::Read)
    }
}

impl Scope {
    pub fn is_granted(&self) -> bool {
        !matches!(self, Scope::None)
    }

    /// Whether resolving this scope needs a relation lookup.
    pub fn requires_ownership_check(&self) -> bool {
        matches!(self, Scope::OwnedOnly | Scope::AssignedOnly)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// A single resolved cell of the policy matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub role: Role,
    pub resource_type: ResourceType,
    pub action: Action,
    pub scope: Scope,
}

impl Permission {
    pub fn is_granted(&self) -> bool {
        self.scope.is_granted()
    }
}

/// A user as held by the user directory. Belongs to exactly one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub role: Role,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl User {
    pub fn new(id: impl Into<UserId>, tenant_id: impl Into<TenantId>, role: Role) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            role,
            active: true,
        }
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Minimal projection of a business record, supplied by the caller.
///
/// `target_role` is the role a `User` record will hold after a create or
/// update (or holds, for a delete). `current_role` is the role an existing
/// `User` record holds before the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub tenant_id: TenantId,
    pub resource_type: ResourceType,
    pub resource_id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assigned_user_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_role: Option<Role>,
}

impl ResourceRef {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        resource_type: ResourceType,
        resource_id: impl Into<ResourceId>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            resource_type,
            resource_id: resource_id.into(),
            owner_id: None,
            assigned_user_ids: Vec::new(),
            target_role: None,
            current_role: None,
        }
    }

    pub fn owned_by(mut self, owner: impl Into<UserId>) -> Self {
        self.owner_id = Some(owner.into());
        self
    }

    pub fn assigned_to(mut self, user: impl Into<UserId>) -> Self {
        self.assigned_user_ids.push(user.into());
        self
    }

    pub fn with_target_role(mut self, role: Role) -> Self {
        self.target_role = Some(role);
        self
    }

    pub fn with_current_role(mut self, role: Role) -> Self {
        self.current_role = Some(role);
        self
    }
}

/// Normalized identity of the caller for one request. Never persisted beyond
/// the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub role: Role,
    pub session_expires_at: DateTime<Utc>,
}

impl AccessContext {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        user_id: impl Into<UserId>,
        role: Role,
        session_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            role,
            session_expires_at,
        }
    }

    pub fn is_session_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.session_expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_role_wire_names() {
        assert_eq!(Role::ApiPartner.as_str(), "api_partner");
        assert_eq!("api-partner".parse::<Role>().unwrap(), Role::ApiPartner);
        assert_eq!(" Owner ".parse::<Role>().unwrap(), Role::Owner);
        assert_eq!(
            serde_json::to_string(&Role::ApiPartner).unwrap(),
            "\"api_partner\""
        );
    }

    #[test]
    fn test_unknown_names_do_not_parse() {
        let err = "superuser".parse::<Role>().unwrap_err();
        assert_eq!(err.kind, "role");
        assert!("ticket".parse::<ResourceType>().is_err());
        assert!(serde_json::from_str::<ResourceType>("\"ticket\"").is_err());
        assert!(serde_json::from_str::<Scope>("\"some\"").is_err());
    }

    #[test]
    fn test_pos_ticket_snake_case() {
        assert_eq!(
            serde_json::from_str::<ResourceType>("\"pos_ticket\"").unwrap(),
            ResourceType::PosTicket
        );
        assert_eq!(ResourceType::PosTicket.to_string(), "pos_ticket");
    }

    #[test]
    fn test_catalog_sizes() {
        assert_eq!(Role::ALL.len(), 5);
        assert_eq!(Action::ALL.len(), 4);
        assert_eq!(ResourceType::ALL.len(), 6);
    }

    #[test]
    fn test_resource_ref_builder() {
        let r = ResourceRef::new("t1", ResourceType::Job, "job-1")
            .owned_by("u1")
            .assigned_to("u2")
            .assigned_to("u3");

        assert_eq!(r.owner_id, Some(UserId::from("u1")));
        assert_eq!(r.assigned_user_ids.len(), 2);
        assert!(r.target_role.is_none());
    }

    #[test]
    fn test_resource_ref_deserializes_minimal_body() {
        let r: ResourceRef = serde_json::from_str(
            r#"{"tenant_id":"t1","resource_type":"invoice","resource_id":"inv-9"}"#,
        )
        .unwrap();
        assert_eq!(r.tenant_id.as_str(), "t1");
        assert!(r.assigned_user_ids.is_empty());
    }

    #[test]
    fn test_session_validity() {
        let now = Utc::now();
        let ctx = AccessContext::new("t1", "u1", Role::Staff, now + Duration::minutes(5));
        assert!(ctx.is_session_valid_at(now));
        assert!(!ctx.is_session_valid_at(now + Duration::minutes(6)));
    }
}
