//! Configuration management.
//!
//! An optional file is layered under `TENANTGUARD__*` environment variables,
//! e.g. `TENANTGUARD__SERVER__PORT=9000` or
//! `TENANTGUARD__AUTH__JWT_SECRET=...`. Every section has defaults, so an
//! empty configuration boots an in-memory engine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::{AuditConfig, AuditSinkKind};
use crate::auth::AuthConfig;
use crate::error::{GuardError, Result};
use crate::rbac::evaluator::DEFAULT_OWNERSHIP_TIMEOUT;
use crate::telemetry::TelemetryConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "TENANTGUARD_CONFIG";

const ENV_PREFIX: &str = "TENANTGUARD";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub policy: PolicySourceConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub ownership: OwnershipConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Token required in `X-Operator-Token` to push policy. Pushing is
    /// disabled when unset.
    #[serde(default)]
    pub operator_token: Option<String>,

    /// Allowed CORS origins; empty allows any.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// How long shutdown waits for the audit queue to drain.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            operator_token: None,
            cors_origins: Vec::new(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Where the policy comes from. Without a path the built-in default policy
/// is loaded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySourceConfig {
    /// TOML, or JSON when the extension is `.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Backing store for relation facts and user records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnershipConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Deadline for a single ownership lookup.
    #[serde(default = "default_ownership_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Seed file for the memory backend (users, relations, customer-job links).
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            timeout: default_ownership_timeout(),
            seed_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Apply bundled migrations at startup.
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
            run_migrations: default_run_migrations(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(10) }
fn default_ownership_timeout() -> Duration { DEFAULT_OWNERSHIP_TIMEOUT }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_run_migrations() -> bool { true }

impl Config {
    /// Load from environment, plus the file named by `TENANTGUARD_CONFIG`
    /// when set.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path),
            _ => Self::build(None),
        }
    }

    /// Load from a specific file, with environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()))
    }

    fn build(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-section checks the field defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.audit.capacity == 0 || self.audit.batch_size == 0 {
            return Err(GuardError::configuration(
                "audit.capacity and audit.batch_size must be greater than zero",
            ));
        }
        if self.ownership.timeout.is_zero() {
            return Err(GuardError::configuration(
                "ownership.timeout must be greater than zero",
            ));
        }
        if self.needs_database() && self.database.url.is_none() {
            return Err(GuardError::configuration(
                "database.url is required when a postgres backend or sink is selected",
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(GuardError::configuration(
                "database.min_connections exceeds database.max_connections",
            ));
        }
        Ok(())
    }

    pub fn needs_database(&self) -> bool {
        self.ownership.backend == StoreBackend::Postgres || self.audit.sink == AuditSinkKind::Postgres
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.ownership.timeout, Duration::from_millis(100));
        assert!(!config.needs_database());
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut config = Config::default();
        config.audit.sink = AuditSinkKind::Postgres;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigurationError);

        config.database.url = Some("postgres://localhost/tenantguard".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
            [server]
            port = 9100
            operator_token = "op-secret"

            [ownership]
            timeout = "250ms"

            [audit]
            capacity = 64
            flush_interval = "1s"

            [auth]
            jwt_secret = "dev-secret"
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.operator_token.as_deref(), Some("op-secret"));
        assert_eq!(config.ownership.timeout, Duration::from_millis(250));
        assert_eq!(config.audit.capacity, 64);
        assert_eq!(config.audit.flush_interval, Duration::from_secs(1));
        assert_eq!(config.audit.batch_size, 256);
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("dev-secret"));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "[audit]\nbatch_size = 0\n").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }
}
