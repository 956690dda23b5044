//! Tenant Guard CLI - operator tooling for the authorization engine.
//!
//! Validates and pushes policies, asks the decision service for decisions
//! and list filters, and checks service health.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use client::Credential;
use commands::{config, evaluate, filter, health, policy};
use output::OutputFormat;

/// Tenant Guard - tenant-isolated policy authorization
#[derive(Parser)]
#[command(
    name = "tenantguard",
    version,
    about = "Tenant Guard - tenant-isolated policy authorization",
    long_about = "CLI tool for managing Tenant Guard policies and querying the decision service.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "TENANTGUARD_API_URL")]
    api_url: Option<String>,

    /// Bearer token identifying the caller
    #[arg(long, global = true, env = "TENANTGUARD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Partner API key identifying the caller
    #[arg(long, global = true, env = "TENANTGUARD_API_KEY", hide_env_values = true, conflicts_with = "token")]
    api_key: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Policy management
    #[command(subcommand)]
    Policy(policy::PolicyCommands),

    /// Ask for an access decision
    Evaluate(evaluate::EvaluateArgs),

    /// Show the list-query filter for a resource type
    Filter(filter::FilterArgs),

    /// Check decision service health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

impl Cli {
    fn credential(&self) -> Credential {
        if let Some(token) = self.token.clone().or_else(|| config::load_value("token")) {
            return Credential::Bearer(token);
        }
        match self.api_key.clone().or_else(|| config::load_value("api-key")) {
            Some(key) => Credential::ApiKey(key),
            None => Credential::None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(|| config::load_value("api-url"))
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url, cli.credential())?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Policy(cmd) => policy::execute(cmd, &client, format).await,
        Commands::Evaluate(args) => evaluate::execute(args, &client, format).await,
        Commands::Filter(args) => filter::execute(args, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
