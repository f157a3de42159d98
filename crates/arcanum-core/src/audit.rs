//! Audit logging system for `Arcanum`.
//!
//! Every mutating or sensitive-read operation produces an [`AuditEvent`].
//!
//! - Mutations go through [`AuditManager::guard`]: a `pending` event is
//!   recorded before anything is written, and if no backend accepts it the
//!   mutation never runs (fail-closed). The outcome event that follows is
//!   best-effort, since the change is already durable by then.
//! - Reads go through [`AuditManager::observe`]: the result is only handed
//!   out once its success event is recorded.
//!
//! When an operation fails, its own error always wins: audit failures on
//! that path are logged and never substituted for the original error.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::error::AuditError;

/// Outcome recorded on an audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The operation was requested and has not run yet.
    Pending,
    /// The operation completed.
    Success,
    /// The operation failed with the given error message.
    Failure { error: String },
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Operation name, e.g. `kv/read` or `transit/rotate`.
    pub operation: String,
    /// Who asked for it.
    pub actor: String,
    /// What it touched: a path, key name, CA name or serial.
    pub resource: String,
    /// How it ended.
    pub outcome: AuditOutcome,
    /// Extra non-sensitive context such as a version number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Start a new event. The outcome defaults to success until observed.
    ///
    /// A mutation's `pending` and outcome events share one `id`.
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        actor: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation: operation.into(),
            actor: actor.into(),
            resource: resource.into(),
            outcome: AuditOutcome::Success,
            detail: None,
        }
    }

    /// Attach a detail string.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Trait for audit log backends.
///
/// Implementations must be safe to share across async tasks.
#[async_trait::async_trait]
pub trait AuditBackend: Send + Sync {
    /// The backend's name (for error reporting).
    fn name(&self) -> &str;

    /// Write an audit event. Must not silently drop events.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be persisted.
    async fn log(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Fans events out to every registered backend with fail-closed semantics.
///
/// If at least one backend succeeds, the event counts as recorded. If all
/// fail, [`AuditError::AllBackendsFailed`] is returned. With no backends
/// registered, logging is a no-op.
#[derive(Default)]
pub struct AuditManager {
    backends: RwLock<Vec<Arc<dyn AuditBackend>>>,
}

impl AuditManager {
    /// Create an audit manager with no backends.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an audit backend.
    pub async fn add_backend(&self, backend: Arc<dyn AuditBackend>) {
        self.backends.write().await.push(backend);
    }

    /// Check whether any audit backends are configured.
    pub async fn has_backends(&self) -> bool {
        !self.backends.read().await.is_empty()
    }

    /// Log an event to all backends.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AllBackendsFailed`] if every backend fails.
    pub async fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let backends = self.backends.read().await;

        if backends.is_empty() {
            return Ok(());
        }

        let mut any_success = false;
        for backend in backends.iter() {
            match backend.log(event).await {
                Ok(()) => any_success = true,
                Err(e) => {
                    warn!(
                        backend = backend.name(),
                        operation = %event.operation,
                        error = %e,
                        "audit backend failed"
                    );
                }
            }
        }

        if any_success {
            Ok(())
        } else {
            Err(AuditError::AllBackendsFailed)
        }
    }

    /// Record the outcome of an operation and pass its result through.
    ///
    /// - `Ok` results are audited before being returned; if the event cannot
    ///   be recorded the caller gets the audit error instead.
    /// - `Err` results are audited with the error message and the original
    ///   error is returned regardless of whether auditing succeeded.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error, or the audit error when a
    /// successful operation could not be recorded.
    pub async fn observe<T, E>(&self, mut event: AuditEvent, result: Result<T, E>) -> Result<T, E>
    where
        E: From<AuditError> + std::fmt::Display,
    {
        match result {
            Ok(value) => {
                event.outcome = AuditOutcome::Success;
                self.log(&event).await?;
                Ok(value)
            }
            Err(e) => {
                event.outcome = AuditOutcome::Failure {
                    error: e.to_string(),
                };
                if let Err(audit_err) = self.log(&event).await {
                    warn!(
                        operation = %event.operation,
                        resource = %event.resource,
                        error = %audit_err,
                        "failed to audit a failed operation"
                    );
                }
                Err(e)
            }
        }
    }
}

impl AuditManager {
    /// Audit a mutation around its execution.
    ///
    /// The event is first logged as [`AuditOutcome::Pending`]. If that fails,
    /// `op` is dropped without being polled and the audit error is returned,
    /// so nothing is written. Otherwise `op` runs and its outcome is logged
    /// under the same event id; a failure to log the outcome is only warned
    /// about because the mutation has already committed.
    ///
    /// # Errors
    ///
    /// Returns the audit error when the request could not be recorded, or
    /// the operation's own error.
    pub async fn guard<T, E, Fut>(&self, event: AuditEvent, op: Fut) -> Result<T, E>
    where
        E: From<AuditError> + std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        self.guard_with(event, op, |_| None).await
    }

    /// Like [`guard`](Self::guard), replacing the event detail on success
    /// with whatever `detail` derives from the result (a version number, a
    /// serial) when it returns `Some`.
    ///
    /// # Errors
    ///
    /// As for [`guard`](Self::guard).
    pub async fn guard_with<T, E, Fut, D>(
        &self,
        mut event: AuditEvent,
        op: Fut,
        detail: D,
    ) -> Result<T, E>
    where
        E: From<AuditError> + std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
        D: FnOnce(&T) -> Option<String>,
    {
        event.outcome = AuditOutcome::Pending;
        self.log(&event).await?;

        let result = op.await;
        event.timestamp = Utc::now();
        event.outcome = match &result {
            Ok(value) => {
                if let Some(d) = detail(value) {
                    event.detail = Some(d);
                }
                AuditOutcome::Success
            }
            Err(e) => AuditOutcome::Failure {
                error: e.to_string(),
            },
        };
        if let Err(audit_err) = self.log(&event).await {
            warn!(
                operation = %event.operation,
                resource = %event.resource,
                event_id = %event.id,
                error = %audit_err,
                "outcome of an audited request could not be recorded"
            );
        }
        result
    }
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager").finish_non_exhaustive()
    }
}

/// Audit backend that keeps events in memory.
///
/// Useful for tests and embedded deployments that ship events elsewhere.
/// [`set_failing`](Self::set_failing) makes every write fail, which is how
/// fail-closed behaviour is exercised.
#[derive(Debug, Default)]
pub struct MemoryAuditBackend {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded event, oldest first.
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Outcome events for one operation name. `pending` request records are
    /// left out; see [`requests_for`](Self::requests_for).
    pub async fn events_for(&self, operation: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.operation == operation && e.outcome != AuditOutcome::Pending)
            .cloned()
            .collect()
    }

    /// `pending` request records for one operation name.
    pub async fn requests_for(&self, operation: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.operation == operation && e.outcome == AuditOutcome::Pending)
            .cloned()
            .collect()
    }

    /// Toggle simulated write failures.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AuditBackend for MemoryAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "memory"
    }

    async fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::BackendFailure {
                name: self.name().to_owned(),
                reason: "simulated failure".to_owned(),
            });
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
