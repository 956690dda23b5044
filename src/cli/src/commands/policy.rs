//! Policy commands: validate and inspect policy files locally, push them to
//! a running server and report the live version.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tabled::Tabled;

use tenantguard_core::api::PolicyStatus;
use tenantguard_core::rbac::{default_policy, PolicyConfig, PolicySnapshot, ResourceType, Role};

use super::config;
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Validate a policy file without contacting the server
    Validate {
        /// Policy file (.toml or .json)
        path: PathBuf,
    },

    /// Show the rules of a policy file, or of the built-in default
    Show {
        /// Policy file; the built-in default when omitted
        path: Option<PathBuf>,

        /// Only show rules for this role
        #[arg(short, long)]
        role: Option<Role>,

        /// Only show rules for this resource type
        #[arg(short = 't', long)]
        resource_type: Option<ResourceType>,
    },

    /// Print the built-in default policy as TOML
    Default,

    /// Validate a policy file and activate it on the server
    Push {
        /// Policy file (.toml or .json)
        path: PathBuf,

        /// Operator token expected by the server
        #[arg(long, env = "TENANTGUARD_OPERATOR_TOKEN", hide_env_values = true)]
        operator_token: Option<String>,
    },

    /// Show the policy the server is enforcing
    Status,
}

#[derive(Debug, Serialize, Tabled)]
struct RuleRow {
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Resource")]
    resource_type: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Scope")]
    scope: String,
}

#[derive(Debug, Serialize)]
struct ValidationSummary {
    path: String,
    version: u64,
    rules: usize,
    escalation_guards: usize,
}

fn load(path: &Path) -> Result<(PolicyConfig, PolicySnapshot)> {
    let config = PolicyConfig::from_path(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let snapshot = PolicySnapshot::load(&config)
        .with_context(|| format!("Policy {} is invalid", path.display()))?;
    Ok((config, snapshot))
}

fn content_type(path: &Path) -> &'static str {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        "application/json"
    } else {
        "application/toml"
    }
}

fn print_status(status: &PolicyStatus, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            output::print_header("Live Policy");
            output::print_detail("Version", &status.version.to_string());
            output::print_detail("Rules", &status.rule_count.to_string());
            output::print_detail("Escalation guards", &status.escalation_guards.to_string());
            output::print_detail("Loaded at", &status.loaded_at.to_rfc3339());
            output::print_detail("Source", status.source.as_deref().unwrap_or("(built-in or pushed)"));
            Ok(())
        }
        _ => output::print_item(status, format),
    }
}

pub async fn execute(cmd: PolicyCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        PolicyCommands::Validate { path } => {
            let (_, snapshot) = load(&path)?;
            let summary = ValidationSummary {
                path: path.display().to_string(),
                version: snapshot.version(),
                rules: snapshot.rule_count(),
                escalation_guards: snapshot.escalation_guards().len(),
            };

            match format {
                OutputFormat::Table => output::print_success(&format!(
                    "{} is valid (version {}, {} rules, {} escalation guards)",
                    summary.path, summary.version, summary.rules, summary.escalation_guards
                )),
                _ => output::print_item(&summary, format)?,
            }
        }

        PolicyCommands::Show {
            path,
            role,
            resource_type,
        } => {
            let config = match &path {
                Some(path) => load(path)?.0,
                None => default_policy(),
            };

            let rows: Vec<RuleRow> = config
                .rules
                .iter()
                .filter(|rule| role.map_or(true, |r| rule.role == r))
                .filter(|rule| resource_type.map_or(true, |t| rule.resource_type == t))
                .map(|rule| RuleRow {
                    role: rule.role.to_string(),
                    resource_type: rule.resource_type.to_string(),
                    action: rule.action.to_string(),
                    scope: rule.scope.to_string(),
                })
                .collect();

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Policy version {}", config.version));
                    output::print_list(&rows, format)?;
                    for guard in &config.escalation_guards {
                        let protected: Vec<&str> =
                            guard.protected_roles.iter().map(Role::as_str).collect();
                        output::print_detail(
                            &format!("{} may not write", guard.actor_role),
                            &protected.join(", "),
                        );
                    }
                    for (resource_type, fields) in &config.field_allowlists {
                        output::print_detail(
                            &format!("api_partner sees on {}", resource_type),
                            &fields.join(", "),
                        );
                    }
                }
                _ => output::print_item(&config, format)?,
            }
        }

        PolicyCommands::Default => {
            print!("{}", default_policy().to_toml_string()?);
        }

        PolicyCommands::Push {
            path,
            operator_token,
        } => {
            let (_, snapshot) = load(&path)?;
            let token = operator_token
                .or_else(|| config::load_value("operator-token"))
                .context("An operator token is required (--operator-token or TENANTGUARD_OPERATOR_TOKEN)")?;
            let body = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;

            let status: PolicyStatus = client
                .put_operator("/v1/policy", body, content_type(&path), &token)
                .await?;

            if let OutputFormat::Table = format {
                output::print_success(&format!(
                    "Policy version {} active (validated locally as version {})",
                    status.version,
                    snapshot.version()
                ));
            }
            print_status(&status, format)?;
        }

        PolicyCommands::Status => {
            let status: PolicyStatus = client.get("/v1/policy").await?;
            print_status(&status, format)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type(Path::new("policy.json")), "application/json");
        assert_eq!(content_type(Path::new("policy.JSON")), "application/json");
        assert_eq!(content_type(Path::new("policy.toml")), "application/toml");
        assert_eq!(content_type(Path::new("policy")), "application/toml");
    }
}
