//! Audit sinks.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use super::{AuditError, AuditRecord};

/// Destination for batches of audit records. A batch arrives ordered by
/// `evaluated_at`; an error means nothing from the batch is considered
/// written and it will be retried.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_batch(&self, records: &[AuditRecord]) -> Result<(), AuditError>;

    fn name(&self) -> &'static str;
}

/// Writes records as structured log lines on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write_batch(&self, records: &[AuditRecord]) -> Result<(), AuditError> {
        for r in records {
            info!(
                target: "audit",
                id = %r.id,
                tenant_id = %r.tenant_id,
                user_id = %r.user_id,
                role = %r.role,
                action = %r.action,
                resource_type = %r.resource_type,
                resource_id = %r.resource_id,
                resource_tenant_id = %r.resource_tenant_id,
                allowed = r.allowed,
                reason_code = %r.reason_code,
                evaluated_at = %r.evaluated_at.to_rfc3339(),
                policy_version = r.policy_version,
                "DECISION"
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Appends records to the `audit_records` table.
#[derive(Debug, Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// Postgres caps bind parameters at 65535 per statement.
const PG_ROWS_PER_INSERT: usize = 4_000;

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn write_batch(&self, records: &[AuditRecord]) -> Result<(), AuditError> {
        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(PG_ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO audit_records (id, tenant_id, user_id, role, action, resource_type, \
                 resource_id, resource_tenant_id, allowed, reason_code, evaluated_at, policy_version) ",
            );
            builder.push_values(chunk, |mut row, r| {
                row.push_bind(r.id)
                    .push_bind(r.tenant_id.as_str())
                    .push_bind(r.user_id.as_str())
                    .push_bind(r.role.as_str())
                    .push_bind(r.action.as_str())
                    .push_bind(r.resource_type.as_str())
                    .push_bind(r.resource_id.as_str())
                    .push_bind(r.resource_tenant_id.as_str())
                    .push_bind(r.allowed)
                    .push_bind(r.reason_code.as_str())
                    .push_bind(r.evaluated_at)
                    .push_bind(r.policy_version as i64);
            });
            builder.push(" ON CONFLICT (id) DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// Keeps records in memory. The availability switch simulates an outage.
#[derive(Debug)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    available: AtomicBool,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write_batch(&self, records: &[AuditRecord]) -> Result<(), AuditError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AuditError::SinkUnavailable("memory sink switched off".into()));
        }
        self.records.lock().extend_from_slice(records);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
