//! Error handling for Tenant Guard.
//!
//! Access denials are not errors: the evaluator always returns a decision.
//! Errors here describe the inability to decide or to serve a request
//! (bad credentials, an invalid policy push, a broken store). Each carries:
//! - a stable machine-readable [`ErrorCode`] with HTTP status and severity
//! - a user-safe message, separate from an internal message for logs
//! - an optional boxed source for chaining
//!
//! # Usage
//!
//! ```rust,ignore
//! use tenantguard_core::error::{ErrorContext, GuardError, Result};
//!
//! fn load() -> Result<PolicyConfig> {
//!     let raw = std::fs::read_to_string(path).context("Failed to read policy file")?;
//!     Ok(PolicyConfig::from_toml_str(&raw)?)
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::audit::AuditError;
use crate::auth::AuthError;
use crate::rbac::{OwnershipError, PolicyLoadError};
use crate::telemetry::TraceContext;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

pub type Result<T> = std::result::Result<T, GuardError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes, grouped by numeric range:
///
/// - 1xxx authentication
/// - 2xxx operator authorization
/// - 3xxx policy
/// - 4xxx relation store / directory
/// - 5xxx audit
/// - 6xxx validation and serialization
/// - 7xxx database
/// - 8xxx configuration
/// - 9xxx internal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingCredential,
    InvalidCredential,
    SessionExpired,
    AccountDeactivated,

    OperatorTokenRequired,
    OperatorTokenInvalid,

    PolicyLoadFailed,
    StalePolicyVersion,
    PolicyFileUnreadable,

    RelationStoreUnavailable,
    DirectoryUnavailable,

    AuditQueueFull,
    AuditSinkUnavailable,

    ValidationError,
    UnknownResourceType,
    SerializationError,
    DeserializationError,

    DatabaseError,
    DatabaseConnectionFailed,
    RecordNotFound,

    ConfigurationError,
    MissingConfiguration,

    InternalError,
}

impl ErrorCode {
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::MissingCredential => 1001,
            Self::InvalidCredential => 1002,
            Self::SessionExpired => 1003,
            Self::AccountDeactivated => 1004,
            Self::OperatorTokenRequired => 2001,
            Self::OperatorTokenInvalid => 2002,
            Self::PolicyLoadFailed => 3001,
            Self::StalePolicyVersion => 3002,
            Self::PolicyFileUnreadable => 3003,
            Self::RelationStoreUnavailable => 4001,
            Self::DirectoryUnavailable => 4002,
            Self::AuditQueueFull => 5001,
            Self::AuditSinkUnavailable => 5002,
            Self::ValidationError => 6001,
            Self::UnknownResourceType => 6002,
            Self::SerializationError => 6003,
            Self::DeserializationError => 6004,
            Self::DatabaseError => 7001,
            Self::DatabaseConnectionFailed => 7002,
            Self::RecordNotFound => 7003,
            Self::ConfigurationError => 8001,
            Self::MissingConfiguration => 8002,
            Self::InternalError => 9001,
        }
    }

    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::MissingCredential
            | Self::InvalidCredential
            | Self::SessionExpired
            | Self::OperatorTokenRequired => StatusCode::UNAUTHORIZED,

            Self::AccountDeactivated | Self::OperatorTokenInvalid => StatusCode::FORBIDDEN,

            Self::PolicyLoadFailed
            | Self::ValidationError
            | Self::UnknownResourceType
            | Self::DeserializationError => StatusCode::UNPROCESSABLE_ENTITY,

            Self::StalePolicyVersion => StatusCode::CONFLICT,

            Self::RecordNotFound => StatusCode::NOT_FOUND,

            Self::RelationStoreUnavailable
            | Self::DirectoryUnavailable
            | Self::AuditSinkUnavailable
            | Self::AuditQueueFull
            | Self::DatabaseConnectionFailed => StatusCode::SERVICE_UNAVAILABLE,

            Self::PolicyFileUnreadable
            | Self::SerializationError
            | Self::DatabaseError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RelationStoreUnavailable
                | Self::DirectoryUnavailable
                | Self::AuditSinkUnavailable
                | Self::AuditQueueFull
                | Self::DatabaseConnectionFailed
        )
    }

    pub const fn category(&self) -> &'static str {
        match self.numeric_code() / 1000 {
            1 => "authentication",
            2 => "operator",
            3 => "policy",
            4 => "relations",
            5 => "audit",
            6 => "validation",
            7 => "database",
            8 => "configuration",
            _ => "internal",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCredential => "MISSING_CREDENTIAL",
            Self::InvalidCredential => "INVALID_CREDENTIAL",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::AccountDeactivated => "ACCOUNT_DEACTIVATED",
            Self::OperatorTokenRequired => "OPERATOR_TOKEN_REQUIRED",
            Self::OperatorTokenInvalid => "OPERATOR_TOKEN_INVALID",
            Self::PolicyLoadFailed => "POLICY_LOAD_FAILED",
            Self::StalePolicyVersion => "STALE_POLICY_VERSION",
            Self::PolicyFileUnreadable => "POLICY_FILE_UNREADABLE",
            Self::RelationStoreUnavailable => "RELATION_STORE_UNAVAILABLE",
            Self::DirectoryUnavailable => "DIRECTORY_UNAVAILABLE",
            Self::AuditQueueFull => "AUDIT_QUEUE_FULL",
            Self::AuditSinkUnavailable => "AUDIT_SINK_UNAVAILABLE",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::UnknownResourceType => "UNKNOWN_RESOURCE_TYPE",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::DeserializationError => "DESERIALIZATION_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::DatabaseConnectionFailed => "DATABASE_CONNECTION_FAILED",
            Self::RecordNotFound => "RECORD_NOT_FOUND",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::MissingConfiguration => "MISSING_CONFIGURATION",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Severity
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Caller mistakes (bad input, expired session)
    Low,
    /// Operator-visible problems (rejected policy push, full audit queue)
    Medium,
    /// Backing service failures
    High,
    /// Needs immediate attention
    Critical,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::MissingCredential
            | ErrorCode::InvalidCredential
            | ErrorCode::SessionExpired
            | ErrorCode::AccountDeactivated
            | ErrorCode::ValidationError
            | ErrorCode::UnknownResourceType
            | ErrorCode::DeserializationError
            | ErrorCode::RecordNotFound => Self::Low,

            ErrorCode::OperatorTokenRequired
            | ErrorCode::OperatorTokenInvalid
            | ErrorCode::PolicyLoadFailed
            | ErrorCode::StalePolicyVersion
            | ErrorCode::AuditQueueFull => Self::Medium,

            ErrorCode::PolicyFileUnreadable
            | ErrorCode::RelationStoreUnavailable
            | ErrorCode::DirectoryUnavailable
            | ErrorCode::AuditSinkUnavailable
            | ErrorCode::SerializationError
            | ErrorCode::DatabaseError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration => Self::High,

            ErrorCode::DatabaseConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured details attached to an error response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty() && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// Crate-level error.
#[derive(Error, Debug)]
pub struct GuardError {
    code: ErrorCode,
    user_message: Cow<'static, str>,
    internal_message: Option<String>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl GuardError {
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Service is misconfigured",
            message,
        )
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.details = self.details.with_context(key, value);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Log at a level matching severity.
    pub fn log(&self) {
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %self.code,
                    category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Request failed"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %self.code,
                    category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Request rejected"
                );
            }
            ErrorSeverity::Low => {
                debug!(
                    error_code = %self.code,
                    category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Request rejected"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "tenantguard_errors_total",
            "code" => self.code.as_str(),
            "category" => self.code.category(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body. Shares its envelope with successful API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: String,
    pub error_code: ErrorCode,
    pub numeric_code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    /// Trace of the failed request, when trace export is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&GuardError> for ErrorResponse {
    fn from(error: &GuardError) -> Self {
        Self {
            success: false,
            data: None,
            error: error.user_message.to_string(),
            error_code: error.code,
            numeric_code: error.code.numeric_code(),
            details: (!error.details.is_empty()).then(|| error.details.clone()),
            trace_id: TraceContext::current_trace_id(),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.http_status();
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

pub trait ErrorContext<T> {
    fn context(self, message: impl Into<String>) -> Result<T>;

    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| GuardError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| GuardError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| GuardError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| GuardError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations
// ═══════════════════════════════════════════════════════════════════════════════

impl From<AuthError> for GuardError {
    fn from(error: AuthError) -> Self {
        let code = match &error {
            AuthError::MissingCredential => ErrorCode::MissingCredential,
            AuthError::InvalidCredential(_) => ErrorCode::InvalidCredential,
            AuthError::SessionExpired => ErrorCode::SessionExpired,
            AuthError::AccountDeactivated => ErrorCode::AccountDeactivated,
            AuthError::DirectoryUnavailable(_) => ErrorCode::DirectoryUnavailable,
            AuthError::Configuration(_) => ErrorCode::ConfigurationError,
        };
        let internal = error.to_string();
        Self::with_internal(code, error_public_message(code), internal).with_source(error)
    }
}

fn error_public_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::MissingCredential => "Authentication credentials are required",
        ErrorCode::InvalidCredential => "The provided credential is invalid",
        ErrorCode::SessionExpired => "The session has expired",
        ErrorCode::AccountDeactivated => "This account has been deactivated",
        ErrorCode::DirectoryUnavailable => "Authentication is temporarily unavailable",
        _ => "An authentication error occurred",
    }
}

impl From<PolicyLoadError> for GuardError {
    fn from(error: PolicyLoadError) -> Self {
        let code = match &error {
            PolicyLoadError::StaleVersion { .. } => ErrorCode::StalePolicyVersion,
            PolicyLoadError::Io { .. } => ErrorCode::PolicyFileUnreadable,
            _ => ErrorCode::PolicyLoadFailed,
        };
        // Policy errors are operator-facing; the message is safe to return.
        let message = error.to_string();
        Self::new(code, message)
            .with_context("kind", error.kind())
            .with_source(error)
    }
}

impl From<OwnershipError> for GuardError {
    fn from(error: OwnershipError) -> Self {
        Self::with_internal(
            ErrorCode::RelationStoreUnavailable,
            "Relation store is unavailable",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<AuditError> for GuardError {
    fn from(error: AuditError) -> Self {
        let code = match &error {
            AuditError::QueueFull => ErrorCode::AuditQueueFull,
            _ => ErrorCode::AuditSinkUnavailable,
        };
        Self::with_internal(code, "Audit trail is unavailable", error.to_string()).with_source(error)
    }
}

impl From<sqlx::Error> for GuardError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "The requested record was not found"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };
        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for GuardError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "Database migration failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<toml::de::Error> for GuardError {
    fn from(error: toml::de::Error) -> Self {
        Self::with_internal(
            ErrorCode::DeserializationError,
            "Failed to parse TOML document",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for GuardError {
    fn from(error: std::io::Error) -> Self {
        let code = match error.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::RecordNotFound,
            _ => ErrorCode::InternalError,
        };
        Self::with_internal(code, "An I/O error occurred", error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for GuardError {
    fn from(error: config::ConfigError) -> Self {
        let code = match &error {
            config::ConfigError::NotFound(_) => ErrorCode::MissingConfiguration,
            _ => ErrorCode::ConfigurationError,
        };
        Self::with_internal(code, "Configuration could not be loaded", error.to_string())
            .with_source(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::InvalidCredential.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::AccountDeactivated.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::StalePolicyVersion.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::PolicyLoadFailed.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_error_code_wire_format() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::StalePolicyVersion).unwrap(),
            "\"STALE_POLICY_VERSION\""
        );
        assert_eq!(ErrorCode::SessionExpired.to_string(), "SESSION_EXPIRED");
    }

    #[test]
    fn test_category_from_numeric_range() {
        assert_eq!(ErrorCode::SessionExpired.category(), "authentication");
        assert_eq!(ErrorCode::AuditQueueFull.category(), "audit");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorCode::DirectoryUnavailable.is_retryable());
        assert!(!ErrorCode::InvalidCredential.is_retryable());
    }

    #[test]
    fn test_auth_error_conversion() {
        let err: GuardError = AuthError::SessionExpired.into();
        assert_eq!(err.code(), ErrorCode::SessionExpired);
        assert_eq!(err.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_policy_error_conversion() {
        let err: GuardError = PolicyLoadError::StaleVersion { offered: 2, live: 3 }.into();
        assert_eq!(err.code(), ErrorCode::StalePolicyVersion);
        assert!(err.user_message().contains("not newer"));
        assert_eq!(err.details().context["kind"], "stale_version");
    }

    #[test]
    fn test_error_response_envelope() {
        let err = GuardError::validation("bad action");
        let json = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "bad action");
        assert_eq!(json["error_code"], "VALIDATION_ERROR");
        assert!(json.get("details").is_none());
        assert!(json.get("trace_id").is_none());
    }

    #[test]
    fn test_error_response_carries_trace_id() {
        use opentelemetry::trace::TracerProvider as _;
        use tracing_subscriber::layer::SubscriberExt;

        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("tenantguard-test")));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("request");
            let _entered = span.enter();
            let response = ErrorResponse::from(&GuardError::validation("bad action"));
            assert_eq!(response.trace_id, TraceContext::current_trace_id());
            assert!(response.trace_id.is_some());
        });
    }

    #[test]
    fn test_display_includes_internal() {
        let err = GuardError::internal("pool exhausted");
        assert_eq!(
            err.to_string(),
            "[INTERNAL_ERROR] An internal error occurred (internal: pool exhausted)"
        );
    }
}
