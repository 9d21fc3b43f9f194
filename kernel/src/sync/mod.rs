// Reconciler
//
// Replays outstanding change records against the remote store in log order.
// A record leaves the log only after the remote confirms it; every other
// outcome keeps it for the next pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::local::LocalStore;
use crate::log::{ChangeId, ChangeRecord, Operation};
use crate::store::KvStore;

pub mod remote;
pub mod report;

pub use remote::{RemoteError, RemoteStore};
pub use report::{ChangeOutcome, ChangeResult, FailureClass, SyncReport};

use remote::bounded;

/// Errors that stop a reconciliation call before any record is attempted.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The log was empty when the pass began. Expected and recoverable.
    #[error("change log is empty; nothing to sync")]
    NothingToSync,

    #[error("a reconciliation pass is already draining")]
    PassInProgress,

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Lifecycle of a reconciler across passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Draining,
}

/// Drains a [`LocalStore`]'s change log into a [`RemoteStore`].
pub struct Reconciler<S: KvStore> {
    local: LocalStore<S>,
    remote: Arc<dyn RemoteStore>,
    timeout: Duration,
    hold_key_after_failure: bool,
    draining: AtomicBool,
}

/// Returns the reconciler to `Idle` when a pass ends, including by
/// cancellation of the pass future.
struct PassGuard<'a> {
    draining: &'a AtomicBool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.draining.store(false, Ordering::Release);
    }
}

impl<S: KvStore> Reconciler<S> {
    pub fn new(local: LocalStore<S>, remote: Arc<dyn RemoteStore>, config: &SyncConfig) -> Self {
        Self {
            local,
            remote,
            timeout: config.remote_timeout(),
            hold_key_after_failure: config.hold_key_after_failure,
            draining: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SyncState {
        if self.draining.load(Ordering::Acquire) {
            SyncState::Draining
        } else {
            SyncState::Idle
        }
    }

    pub fn local(&self) -> &LocalStore<S> {
        &self.local
    }

    /// Apply one record to the remote without touching the log.
    pub async fn sync_single_change(&self, change: &ChangeRecord) -> Result<(), RemoteError> {
        match change.operation {
            Operation::Insert | Operation::Update => {
                let value = change.new_value.as_deref().ok_or_else(|| {
                    RemoteError::rejected(format!("change {} has no new value", change.change_id))
                })?;
                bounded(self.timeout, self.remote.upsert(&change.key, value)).await
            }
            Operation::Delete => bounded(self.timeout, self.remote.delete(&change.key)).await,
        }
    }

    /// Apply one record and remove it from the log on success.
    #[instrument(skip_all, fields(change_id = change.change_id, key = %change.key))]
    pub async fn sync_change(&self, change: &ChangeRecord) -> ChangeOutcome {
        if let Err(err) = self.sync_single_change(change).await {
            warn!(error = %err, operation = ?change.operation, "Failed to sync change");
            return ChangeOutcome::from_remote(&err);
        }

        match self.local.acknowledge(change.change_id).await {
            Ok(removed) => {
                debug!(removed, "Change synced");
                ChangeOutcome::Synced
            }
            Err(err) => {
                warn!(error = %err, "Remote applied change but acknowledgement failed");
                ChangeOutcome::Failed {
                    class: FailureClass::Local,
                    reason: err.to_string(),
                }
            }
        }
    }

    /// One full pass over the records outstanding when the pass begins.
    ///
    /// Records appended during the pass wait for the next one. Per-record
    /// failures are reported, never raised.
    #[instrument(skip_all)]
    pub async fn sync_all_changes(&self) -> Result<SyncReport, ReconcileError> {
        let _guard = self.begin_pass()?;

        let snapshot = self.local.pending_changes().await;
        if snapshot.is_empty() {
            return Err(ReconcileError::NothingToSync);
        }

        info!(changes = snapshot.len(), "Starting reconciliation pass");

        let mut report = SyncReport::default();
        let mut blocked: HashMap<String, ChangeId> = HashMap::new();

        for change in snapshot {
            let outcome = match blocked.get(&change.key) {
                Some(&blocked_by) => ChangeOutcome::Deferred { blocked_by },
                None => self.sync_change(&change).await,
            };

            if self.hold_key_after_failure && !outcome.is_synced() {
                blocked.entry(change.key.clone()).or_insert(change.change_id);
            }

            report.results.push(ChangeResult {
                change_id: change.change_id,
                key: change.key,
                operation: change.operation,
                outcome,
            });
        }

        info!(
            synced = report.synced().count(),
            failed = report.failed().count(),
            deferred = report.deferred().count(),
            "Reconciliation pass finished"
        );

        Ok(report)
    }

    /// Send the outstanding log to the remote as one batch. Removes nothing.
    #[instrument(skip_all)]
    pub async fn upload_change_log(&self) -> Result<usize, ReconcileError> {
        let snapshot = self.local.pending_changes().await;
        if snapshot.is_empty() {
            return Err(ReconcileError::NothingToSync);
        }

        bounded(self.timeout, self.remote.upload_change_log(&snapshot)).await?;
        info!(changes = snapshot.len(), "Uploaded change log");
        Ok(snapshot.len())
    }

    fn begin_pass(&self) -> Result<PassGuard<'_>, ReconcileError> {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ReconcileError::PassInProgress)?;
        Ok(PassGuard {
            draining: &self.draining,
        })
    }
}
