//! Predicate filters for list and read queries.
//!
//! A role's scope on a resource type is compiled into a storage-agnostic
//! [`PredicateExpr`]. The data-access layer applies it before rows materialize,
//! either by rendering it to SQL or by matching it in memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::models::{AccessContext, Action, ResourceType, Scope, TenantId, UserId};
use super::policy::{PolicySnapshot, PolicyStore};

// ═══════════════════════════════════════════════════════════════════════════════
// Predicate AST
// ═══════════════════════════════════════════════════════════════════════════════

/// Filterable attribute of a business record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TenantId,
    OwnerId,
    AssignedUserIds,
    AllowlistedUserIds,
    LinkedJobAssigneeIds,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::TenantId => "tenant_id",
            Field::OwnerId => "owner_id",
            Field::AssignedUserIds => "assigned_user_ids",
            Field::AllowlistedUserIds => "allowlisted_user_ids",
            Field::LinkedJobAssigneeIds => "linked_job_assignee_ids",
        }
    }

    /// Multi-valued fields match when any element matches.
    pub fn is_multi_valued(&self) -> bool {
        !matches!(self, Field::TenantId)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean filter expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PredicateExpr {
    True,
    False,
    Eq { field: Field, value: String },
    In { field: Field, values: Vec<String> },
    And { operands: Vec<PredicateExpr> },
    Or { operands: Vec<PredicateExpr> },
}

impl PredicateExpr {
    pub fn equals(field: Field, value: impl Into<String>) -> Self {
        PredicateExpr::Eq {
            field,
            value: value.into(),
        }
    }

    pub fn any_of(field: Field, values: Vec<String>) -> Self {
        if values.is_empty() {
            return PredicateExpr::False;
        }
        PredicateExpr::In { field, values }
    }

    /// Conjunction, folding constants and nested conjunctions.
    pub fn and(operands: Vec<PredicateExpr>) -> Self {
        let mut flat = Vec::with_capacity(operands.len());
        for op in operands {
            match op {
                PredicateExpr::True => {}
                PredicateExpr::False => return PredicateExpr::False,
                PredicateExpr::And { operands } => flat.extend(operands),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => PredicateExpr::True,
            1 => flat.remove(0),
            _ => PredicateExpr::And { operands: flat },
        }
    }

    /// Disjunction, folding constants and nested disjunctions.
    pub fn or(operands: Vec<PredicateExpr>) -> Self {
        let mut flat = Vec::with_capacity(operands.len());
        for op in operands {
            match op {
                PredicateExpr::False => {}
                PredicateExpr::True => return PredicateExpr::True,
                PredicateExpr::Or { operands } => flat.extend(operands),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => PredicateExpr::False,
            1 => flat.remove(0),
            _ => PredicateExpr::Or { operands: flat },
        }
    }

    pub fn is_false(&self) -> bool {
        matches!(self, PredicateExpr::False)
    }

    /// Evaluate against an in-memory row.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            PredicateExpr::True => true,
            PredicateExpr::False => false,
            PredicateExpr::Eq { field, value } => row.values(*field).any(|v| v == value),
            PredicateExpr::In { field, values } => {
                row.values(*field).any(|v| values.iter().any(|x| x == v))
            }
            PredicateExpr::And { operands } => operands.iter().all(|op| op.matches(row)),
            PredicateExpr::Or { operands } => operands.iter().any(|op| op.matches(row)),
        }
    }

    /// Render a parameterized Postgres `WHERE` fragment using the bundled
    /// column layout.
    pub fn to_sql(&self) -> SqlFilter {
        self.to_sql_with(&ColumnMap::default())
    }

    pub fn to_sql_with(&self, columns: &ColumnMap) -> SqlFilter {
        let mut params = Vec::new();
        let clause = render(self, columns, &mut params);
        SqlFilter { clause, params }
    }
}

fn render(expr: &PredicateExpr, columns: &ColumnMap, params: &mut Vec<String>) -> String {
    match expr {
        PredicateExpr::True => "TRUE".to_string(),
        PredicateExpr::False => "FALSE".to_string(),
        PredicateExpr::Eq { field, value } => {
            params.push(value.clone());
            columns.get(*field).compare(&format!("${}", params.len()))
        }
        PredicateExpr::In { values, .. } if values.is_empty() => "FALSE".to_string(),
        PredicateExpr::In { field, values } => {
            let column = columns.get(*field);
            let parts: Vec<String> = values
                .iter()
                .map(|v| {
                    params.push(v.clone());
                    column.compare(&format!("${}", params.len()))
                })
                .collect();
            format!("({})", parts.join(" OR "))
        }
        // Empty operand lists keep the identities `matches` uses.
        PredicateExpr::And { operands } if operands.is_empty() => "TRUE".to_string(),
        PredicateExpr::Or { operands } if operands.is_empty() => "FALSE".to_string(),
        PredicateExpr::And { operands } => join(operands, " AND ", columns, params),
        PredicateExpr::Or { operands } => join(operands, " OR ", columns, params),
    }
}

fn join(operands: &[PredicateExpr], sep: &str, columns: &ColumnMap, params: &mut Vec<String>) -> String {
    let parts: Vec<String> = operands.iter().map(|op| render(op, columns, params)).collect();
    format!("({})", parts.join(sep))
}

/// Rendered SQL fragment with positional (`$n`) parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlFilter {
    pub clause: String,
    pub params: Vec<String>,
}

/// How a field is stored in the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlColumn {
    /// Scalar column compared with `=`.
    Scalar(String),
    /// Array column, matched with `= ANY(...)`.
    Array(String),
    /// Arbitrary SQL where `{}` stands for the parameter placeholder.
    Template(String),
}

impl SqlColumn {
    fn compare(&self, placeholder: &str) -> String {
        match self {
            SqlColumn::Scalar(col) => format!("{col} = {placeholder}"),
            SqlColumn::Array(col) => format!("{placeholder} = ANY({col})"),
            SqlColumn::Template(tpl) => tpl.replace("{}", placeholder),
        }
    }
}

/// Field to column mapping used by the SQL renderer.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    pub tenant_id: SqlColumn,
    pub owner_id: SqlColumn,
    pub assigned_user_ids: SqlColumn,
    pub allowlisted_user_ids: SqlColumn,
    pub linked_job_assignee_ids: SqlColumn,
}

impl ColumnMap {
    pub fn get(&self, field: Field) -> &SqlColumn {
        match field {
            Field::TenantId => &self.tenant_id,
            Field::OwnerId => &self.owner_id,
            Field::AssignedUserIds => &self.assigned_user_ids,
            Field::AllowlistedUserIds => &self.allowlisted_user_ids,
            Field::LinkedJobAssigneeIds => &self.linked_job_assignee_ids,
        }
    }
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            tenant_id: SqlColumn::Scalar("tenant_id".into()),
            owner_id: SqlColumn::Scalar("owner_id".into()),
            assigned_user_ids: SqlColumn::Array("assigned_user_ids".into()),
            allowlisted_user_ids: SqlColumn::Array("allowlisted_user_ids".into()),
            linked_job_assignee_ids: SqlColumn::Array("linked_job_assignee_ids".into()),
        }
    }
}

/// In-memory view of a record used by [`PredicateExpr::matches`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub tenant_id: TenantId,
    pub owner_ids: Vec<UserId>,
    pub assigned_user_ids: Vec<UserId>,
    pub allowlisted_user_ids: Vec<UserId>,
    pub linked_job_assignee_ids: Vec<UserId>,
}

impl Row {
    fn values(&self, field: Field) -> Box<dyn Iterator<Item = &str> + '_> {
        match field {
            Field::TenantId => Box::new(std::iter::once(self.tenant_id.as_str())),
            Field::OwnerId => Box::new(self.owner_ids.iter().map(UserId::as_str)),
            Field::AssignedUserIds => Box::new(self.assigned_user_ids.iter().map(UserId::as_str)),
            Field::AllowlistedUserIds => {
                Box::new(self.allowlisted_user_ids.iter().map(UserId::as_str))
            }
            Field::LinkedJobAssigneeIds => {
                Box::new(self.linked_job_assignee_ids.iter().map(UserId::as_str))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Generator
// ═══════════════════════════════════════════════════════════════════════════════

/// Compile a scope into the read predicate for `ctx` on `resource_type`.
pub fn scope_predicate(scope: Scope, ctx: &AccessContext, resource_type: ResourceType) -> PredicateExpr {
    let tenant = PredicateExpr::equals(Field::TenantId, ctx.tenant_id.as_str());
    let user = ctx.user_id.as_str();

    match scope {
        Scope::None => PredicateExpr::False,
        Scope::All => tenant,
        Scope::OwnedOnly => PredicateExpr::and(vec![tenant, PredicateExpr::equals(Field::OwnerId, user)]),
        Scope::AssignedOnly => {
            let mut reach = vec![
                PredicateExpr::equals(Field::AssignedUserIds, user),
                PredicateExpr::equals(Field::AllowlistedUserIds, user),
            ];
            if resource_type == ResourceType::Customer {
                reach.push(PredicateExpr::equals(Field::LinkedJobAssigneeIds, user));
            }
            PredicateExpr::and(vec![tenant, PredicateExpr::or(reach)])
        }
    }
}

/// Read filter for `ctx` against a given snapshot.
pub fn read_filter(snapshot: &PolicySnapshot, ctx: &AccessContext, resource_type: ResourceType) -> PredicateExpr {
    let permission = snapshot.lookup(ctx.role, resource_type, Action::Read);
    scope_predicate(permission.scope, ctx, resource_type)
}

/// Produces read filters from the live policy.
#[derive(Debug, Clone)]
pub struct PredicateFilterGenerator {
    policies: Arc<PolicyStore>,
}

impl PredicateFilterGenerator {
    pub fn new(policies: Arc<PolicyStore>) -> Self {
        Self { policies }
    }

    pub fn filter_for(&self, ctx: &AccessContext, resource_type: ResourceType) -> PredicateExpr {
        read_filter(&self.policies.snapshot(), ctx, resource_type)
    }

    /// Like [`filter_for`](Self::filter_for) for an unparsed type name.
    /// Unknown names select nothing.
    pub fn filter_for_name(&self, ctx: &AccessContext, resource_type: &str) -> PredicateExpr {
        match resource_type.parse::<ResourceType>() {
            Ok(rt) => self.filter_for(ctx, rt),
            Err(_) => PredicateExpr::False,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::models::Role;
    use chrono::{Duration, Utc};

    fn ctx(role: Role) -> AccessContext {
        AccessContext::new("t1", "u1", role, Utc::now() + Duration::hours(1))
    }

    fn row(tenant: &str) -> Row {
        Row {
            tenant_id: tenant.into(),
            owner_ids: vec![],
            assigned_user_ids: vec![],
            allowlisted_user_ids: vec![],
            linked_job_assignee_ids: vec![],
        }
    }

    #[test]
    fn test_constant_folding() {
        let e = PredicateExpr::and(vec![PredicateExpr::True, PredicateExpr::equals(Field::OwnerId, "u")]);
        assert_eq!(e, PredicateExpr::equals(Field::OwnerId, "u"));
        assert!(PredicateExpr::and(vec![PredicateExpr::False, PredicateExpr::True]).is_false());
        assert_eq!(PredicateExpr::or(vec![]), PredicateExpr::False);
        assert!(PredicateExpr::any_of(Field::OwnerId, vec![]).is_false());
    }

    #[test]
    fn test_empty_lists_render_valid_sql() {
        // Built without the simplifying constructors, as a deserialized body would be.
        let expr: PredicateExpr = serde_json::from_str(
            r#"{"op":"and","operands":[
                {"op":"eq","field":"tenant_id","value":"t1"},
                {"op":"in","field":"assigned_user_ids","values":[]}
            ]}"#,
        )
        .unwrap();
        let sql = expr.to_sql();
        assert_eq!(sql.clause, "(tenant_id = $1 AND FALSE)");
        assert_eq!(sql.params, vec!["t1".to_string()]);
        assert!(!sql.clause.contains("()"));
        assert!(!expr.matches(&row("t1")));

        let empty_and = PredicateExpr::And { operands: vec![] };
        let empty_or = PredicateExpr::Or { operands: vec![] };
        assert_eq!(empty_and.to_sql().clause, "TRUE");
        assert_eq!(empty_or.to_sql().clause, "FALSE");
        assert!(empty_and.matches(&row("t1")));
        assert!(!empty_or.matches(&row("t1")));
    }

    #[test]
    fn test_scope_shapes() {
        let c = ctx(Role::Staff);
        assert_eq!(scope_predicate(Scope::None, &c, ResourceType::Job), PredicateExpr::False);
        assert_eq!(
            scope_predicate(Scope::All, &c, ResourceType::Job),
            PredicateExpr::equals(Field::TenantId, "t1")
        );

        let customer = scope_predicate(Scope::AssignedOnly, &c, ResourceType::Customer);
        let job = scope_predicate(Scope::AssignedOnly, &c, ResourceType::Job);
        assert!(serde_json::to_string(&customer).unwrap().contains("linked_job_assignee_ids"));
        assert!(!serde_json::to_string(&job).unwrap().contains("linked_job_assignee_ids"));
    }

    #[test]
    fn test_multi_valued_match() {
        let expr = scope_predicate(Scope::AssignedOnly, &ctx(Role::Staff), ResourceType::Job);

        let mut r = row("t1");
        r.assigned_user_ids = vec!["u7".into(), "u1".into()];
        assert!(expr.matches(&r));

        r.assigned_user_ids = vec!["u7".into()];
        assert!(!expr.matches(&r));

        let mut foreign = row("t2");
        foreign.assigned_user_ids = vec!["u1".into()];
        assert!(!expr.matches(&foreign));
    }

    #[test]
    fn test_sql_rendering() {
        let expr = scope_predicate(Scope::AssignedOnly, &ctx(Role::Staff), ResourceType::Customer);
        let sql = expr.to_sql();
        assert_eq!(
            sql.clause,
            "(tenant_id = $1 AND ($2 = ANY(assigned_user_ids) OR $3 = ANY(allowlisted_user_ids) OR $4 = ANY(linked_job_assignee_ids)))"
        );
        assert_eq!(sql.params, vec!["t1", "u1", "u1", "u1"]);

        assert_eq!(PredicateExpr::False.to_sql().clause, "FALSE");
    }

    #[test]
    fn test_sql_template_column() {
        let mut columns = ColumnMap::default();
        columns.owner_id = SqlColumn::Template("created_by = {}".into());
        let expr = scope_predicate(Scope::OwnedOnly, &ctx(Role::Staff), ResourceType::Invoice);
        assert_eq!(expr.to_sql_with(&columns).clause, "(tenant_id = $1 AND created_by = $2)");
    }

    #[test]
    fn test_predicate_wire_format() {
        let json = serde_json::to_value(PredicateExpr::equals(Field::TenantId, "t1")).unwrap();
        assert_eq!(json["op"], "eq");
        assert_eq!(json["field"], "tenant_id");
        assert_eq!(serde_json::to_value(PredicateExpr::False).unwrap()["op"], "false");
    }

    #[test]
    fn test_unknown_type_name_selects_nothing() {
        let store = Arc::new(PolicyStore::with_defaults().unwrap());
        let generator = PredicateFilterGenerator::new(store);
        assert!(generator.filter_for_name(&ctx(Role::Owner), "payroll").is_false());
        assert!(!generator.filter_for_name(&ctx(Role::Owner), "pos_ticket").is_false());
    }
}
