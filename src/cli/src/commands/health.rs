//! Health check command.
//!
//! Queries the `/health` endpoint and reports the live policy version and
//! the audit backlog.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Exit non-zero when the audit backlog exceeds this many records
    #[arg(long)]
    max_audit_pending: Option<u64>,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: serde_json::Value = client.get_raw("/health").await?;
    let status = health
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let pending = health.get("audit_pending").and_then(|v| v.as_u64());

    match format {
        OutputFormat::Table => {
            output::print_header("Decision Service Health");
            output::print_detail("Status", status);
            output::print_detail("API URL", client.base_url());

            if let Some(version) = health.get("version").and_then(|v| v.as_str()) {
                output::print_detail("Version", version);
            }
            if let Some(policy) = health.get("policy_version").and_then(|v| v.as_u64()) {
                output::print_detail("Policy version", &policy.to_string());
            }
            if let Some(pending) = pending {
                output::print_detail("Audit pending", &pending.to_string());
            }
            if let Some(ts) = health.get("timestamp").and_then(|v| v.as_str()) {
                output::print_detail("Timestamp", ts);
            }

            if status == "healthy" {
                output::print_success("Decision service operational");
            } else {
                output::print_error(&format!("Service status: {}", status));
            }
        }
        _ => output::print_item(&health, format)?,
    }

    if let (Some(limit), Some(pending)) = (args.max_audit_pending, pending) {
        if pending > limit {
            anyhow::bail!("Audit backlog {} exceeds limit {}", pending, limit);
        }
    }

    Ok(())
}
