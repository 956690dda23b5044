//! Audit trail of access decisions.
//!
//! Every decision becomes an [`AuditRecord`] pushed onto a bounded queue with
//! `try_send`, so recording never waits on the sink. A background worker drains
//! the queue in batches and retries a failing sink with backoff. While it
//! retries the queue keeps buffering; once full, new records are dropped and
//! counted.
//!
//! Each batch reaches the sink sorted by `evaluated_at`. Decisions racing
//! across a batch boundary can still land out of order, so readers of the
//! trail order by `evaluated_at`, never by insertion order.

pub mod sink;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::rbac::{AccessDecision, Action, ReasonCode, ResourceId, ResourceType, Role, TenantId, UserId};

pub use sink::{AuditSink, MemoryAuditSink, PgAuditSink, TracingAuditSink};

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit queue is full; record dropped")]
    QueueFull,

    #[error("Audit worker has stopped")]
    Closed,

    #[error("Audit sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Audit sink write failed: {0}")]
    Database(#[from] sqlx::Error),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted form of one decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub role: Role,
    pub action: Action,
    pub resource_type: ResourceType,
    pub resource_id: ResourceId,
    /// Tenant named by the resource reference; differs from `tenant_id` on
    /// cross-tenant denials.
    pub resource_tenant_id: TenantId,
    pub allowed: bool,
    pub reason_code: ReasonCode,
    pub evaluated_at: DateTime<Utc>,
    pub policy_version: u64,
}

impl From<&AccessDecision> for AuditRecord {
    fn from(decision: &AccessDecision) -> Self {
        let ctx = decision.context();
        let resource = decision.resource_ref();
        Self {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id.clone(),
            user_id: ctx.user_id.clone(),
            role: ctx.role,
            action: decision.action(),
            resource_type: resource.resource_type,
            resource_id: resource.resource_id.clone(),
            resource_tenant_id: resource.tenant_id.clone(),
            allowed: decision.allowed(),
            reason_code: decision.reason_code(),
            evaluated_at: decision.evaluated_at(),
            policy_version: decision.policy_version(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Which sink the audit worker writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    #[default]
    Log,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub sink: AuditSinkKind,

    /// Records buffered before new ones are dropped.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Longest a partial batch waits before it is flushed.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// First retry delay after a sink failure; doubles up to `max_retry_backoff`.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    #[serde(default = "default_max_retry_backoff", with = "humantime_serde")]
    pub max_retry_backoff: Duration,

    /// Backlog size that starts the alert window.
    #[serde(default = "default_backlog_alert_threshold")]
    pub backlog_alert_threshold: usize,

    #[serde(default = "default_backlog_alert_after", with = "humantime_serde")]
    pub backlog_alert_after: Duration,
}

fn default_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    256
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_retry_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_backlog_alert_threshold() -> usize {
    5_000
}

fn default_backlog_alert_after() -> Duration {
    Duration::from_secs(30)
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditSinkKind::default(),
            capacity: default_capacity(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            retry_backoff: default_retry_backoff(),
            max_retry_backoff: default_max_retry_backoff(),
            backlog_alert_threshold: default_backlog_alert_threshold(),
            backlog_alert_after: default_backlog_alert_after(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Logger
// ═══════════════════════════════════════════════════════════════════════════════

/// Attempts made to flush the final batch once every logger handle is gone.
const SHUTDOWN_FLUSH_ATTEMPTS: u32 = 3;

/// Handle used to record decisions. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    sender: mpsc::Sender<AuditRecord>,
    queued: Arc<AtomicUsize>,
    backlog_alerts: Arc<AtomicU64>,
}

/// Join handle of the background worker.
#[derive(Debug)]
pub struct AuditWorker {
    handle: JoinHandle<()>,
}

impl AuditWorker {
    /// Wait for the worker to drain. Returns once every [`AuditLogger`] clone
    /// has been dropped and the final batch is flushed or abandoned.
    pub async fn drained(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "Audit worker terminated abnormally");
        }
    }
}

impl AuditLogger {
    /// Start the worker on the current runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, config: AuditConfig) -> (Self, AuditWorker) {
        let capacity = config.capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let queued = Arc::new(AtomicUsize::new(0));
        let backlog_alerts = Arc::new(AtomicU64::new(0));

        info!(sink = sink.name(), capacity, batch_size = config.batch_size, "Starting audit worker");

        let worker = Worker {
            receiver,
            sink,
            config,
            queued: queued.clone(),
            backlog_alerts: backlog_alerts.clone(),
        };
        let handle = tokio::spawn(worker.run());

        (
            Self {
                sender,
                queued,
                backlog_alerts,
            },
            AuditWorker { handle },
        )
    }

    /// Queue a decision. Never blocks.
    pub fn record(&self, decision: &AccessDecision) -> Result<(), AuditError> {
        self.enqueue(AuditRecord::from(decision))
    }

    pub fn enqueue(&self, record: AuditRecord) -> Result<(), AuditError> {
        // Counted before sending so the worker never decrements below zero.
        let depth = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        match self.sender.try_send(record) {
            Ok(()) => {
                gauge!("tenantguard_audit_queue_depth").set(depth as f64);
                Ok(())
            }
            Err(TrySendError::Full(record)) => {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                counter!("tenantguard_audit_dropped_total").increment(1);
                debug!(record_id = %record.id, "Audit queue full; dropping record");
                Err(AuditError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                Err(AuditError::Closed)
            }
        }
    }

    /// Records waiting in the queue (not yet taken by the worker).
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Backlog alerts raised since the worker started. One per episode of the
    /// backlog staying above the threshold.
    pub fn backlog_alerts(&self) -> u64 {
        self.backlog_alerts.load(Ordering::Relaxed)
    }
}

struct Worker {
    receiver: mpsc::Receiver<AuditRecord>,
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
    queued: Arc<AtomicUsize>,
    backlog_alerts: Arc<AtomicU64>,
}

impl Worker {
    async fn run(mut self) {
        let batch_size = self.config.batch_size.max(1);
        let mut batch: Vec<AuditRecord> = Vec::with_capacity(batch_size);
        let period = self.config.flush_interval.max(Duration::from_millis(1));
        // First tick one period out, so a partial batch always gets the full interval.
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut backoff = self.config.retry_backoff;
        let mut retry_at: Option<Instant> = None;
        let mut backlog_since: Option<Instant> = None;
        let mut alerted = false;
        let mut closed = false;

        loop {
            // Stop pulling while a full batch is pending, so a failing sink
            // backs up into the bounded queue instead of into memory.
            let flush_due = tokio::select! {
                received = self.receiver.recv(), if !closed && batch.len() < batch_size => {
                    match received {
                        Some(record) => {
                            self.queued.fetch_sub(1, Ordering::Relaxed);
                            batch.push(record);
                            batch.len() >= batch_size
                        }
                        None => {
                            closed = true;
                            true
                        }
                    }
                }
                _ = ticker.tick() => !batch.is_empty(),
            };

            let depth = batch.len() + self.queued.load(Ordering::Relaxed);
            gauge!("tenantguard_audit_queue_depth").set(depth as f64);
            self.watch_backlog(depth, &mut backlog_since, &mut alerted);

            if closed {
                self.final_flush(&mut batch).await;
                break;
            }

            if !flush_due || batch.is_empty() {
                continue;
            }
            if retry_at.is_some_and(|at| Instant::now() < at) {
                continue;
            }

            batch.sort_by_key(|r| r.evaluated_at);
            match self.sink.write_batch(&batch).await {
                Ok(()) => {
                    counter!("tenantguard_audit_written_total").increment(batch.len() as u64);
                    batch.clear();
                    backoff = self.config.retry_backoff;
                    retry_at = None;
                }
                Err(e) => {
                    counter!("tenantguard_audit_sink_failures_total").increment(1);
                    warn!(
                        error = %e,
                        sink = self.sink.name(),
                        pending = batch.len(),
                        retry_in_ms = backoff.as_millis() as u64,
                        "Audit sink write failed; will retry"
                    );
                    retry_at = Some(Instant::now() + backoff);
                    backoff = (backoff * 2).min(self.config.max_retry_backoff);
                }
            }
        }

        info!(sink = self.sink.name(), "Audit worker stopped");
    }

    fn watch_backlog(&self, depth: usize, since: &mut Option<Instant>, alerted: &mut bool) {
        if depth < self.config.backlog_alert_threshold {
            *since = None;
            *alerted = false;
            return;
        }

        let started = *since.get_or_insert_with(Instant::now);
        if !*alerted && started.elapsed() >= self.config.backlog_alert_after {
            *alerted = true;
            self.backlog_alerts.fetch_add(1, Ordering::Relaxed);
            counter!("tenantguard_audit_backlog_alerts_total").increment(1);
            error!(
                depth,
                threshold = self.config.backlog_alert_threshold,
                sink = self.sink.name(),
                "Audit backlog above threshold"
            );
        }
    }

    async fn final_flush(&mut self, batch: &mut Vec<AuditRecord>) {
        while let Ok(record) = self.receiver.try_recv() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            batch.push(record);
        }
        if batch.is_empty() {
            return;
        }

        batch.sort_by_key(|r| r.evaluated_at);
        let mut delay = self.config.retry_backoff;
        for attempt in 1..=SHUTDOWN_FLUSH_ATTEMPTS {
            match self.sink.write_batch(batch).await {
                Ok(()) => {
                    counter!("tenantguard_audit_written_total").increment(batch.len() as u64);
                    batch.clear();
                    return;
                }
                Err(e) => {
                    counter!("tenantguard_audit_sink_failures_total").increment(1);
                    warn!(error = %e, attempt, "Final audit flush failed");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_retry_backoff);
                }
            }
        }

        counter!("tenantguard_audit_dropped_total").increment(batch.len() as u64);
        error!(dropped = batch.len(), "Abandoning audit records at shutdown");
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_toml() {
        let config: AuditConfig = toml::from_str("").unwrap();
        assert_eq!(config.sink, AuditSinkKind::Log);
        assert_eq!(config.capacity, 10_000);
        assert_eq!(config.flush_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_config_humantime_durations() {
        let config: AuditConfig = toml::from_str(
            r#"
            sink = "postgres"
            retry_backoff = "2s"
            backlog_alert_after = "1m"
            "#,
        )
        .unwrap();
        assert_eq!(config.sink, AuditSinkKind::Postgres);
        assert_eq!(config.retry_backoff, Duration::from_secs(2));
        assert_eq!(config.backlog_alert_after, Duration::from_secs(60));
    }
}
