//! Ask the server for a single access decision.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use tenantguard_core::api::{DecisionRequest, DecisionResponse};
use tenantguard_core::rbac::{Action, ResourceRef, ResourceType, Role, UserId};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct EvaluateArgs {
    /// Action to check (create, read, update, delete)
    action: Action,

    /// Resource type (invoice, customer, job, ...)
    resource_type: ResourceType,

    /// Resource identifier
    resource_id: String,

    /// Tenant that owns the resource
    #[arg(short, long)]
    tenant: String,

    /// Owner of the resource
    #[arg(long)]
    owner: Option<String>,

    /// Users assigned to the resource (repeatable)
    #[arg(long = "assigned", value_name = "USER")]
    assigned: Vec<String>,

    /// Role a user record will hold after the change
    #[arg(long)]
    target_role: Option<Role>,

    /// Role a user record holds now
    #[arg(long)]
    current_role: Option<Role>,

    /// Exit non-zero on deny
    #[arg(long)]
    strict: bool,
}

impl EvaluateArgs {
    fn request(&self) -> DecisionRequest {
        let mut resource = ResourceRef::new(
            self.tenant.as_str(),
            self.resource_type,
            self.resource_id.as_str(),
        );
        resource.owner_id = self.owner.as_deref().map(UserId::from);
        resource.assigned_user_ids = self.assigned.iter().map(|u| UserId::from(u.as_str())).collect();
        resource.target_role = self.target_role;
        resource.current_role = self.current_role;

        DecisionRequest {
            action: self.action,
            resource,
        }
    }
}

#[derive(Serialize)]
struct DecisionOutput<'a> {
    request: &'a DecisionRequest,
    decision: &'a DecisionResponse,
}

pub async fn execute(args: EvaluateArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let request = args.request();
    let decision: DecisionResponse = client.post("/v1/decisions", &request).await?;

    match format {
        OutputFormat::Table => {
            output::print_verdict(decision.allowed, decision.reason_code.as_str());
            output::print_detail("Result", decision.result.as_str());
            output::print_detail(
                "Resource",
                &format!(
                    "{}/{} in {}",
                    request.resource.resource_type, request.resource.resource_id, request.resource.tenant_id
                ),
            );
            output::print_detail("Policy version", &decision.policy_version.to_string());
            if let Some(fields) = &decision.field_allowlist {
                output::print_detail("Visible fields", &fields.join(", "));
            }
        }
        _ => output::print_item(
            &DecisionOutput {
                request: &request,
                decision: &decision,
            },
            format,
        )?,
    }

    if args.strict && !decision.allowed {
        anyhow::bail!("Access denied: {}", decision.reason_code);
    }
    Ok(())
}
