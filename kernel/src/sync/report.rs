// Reconciliation Report
//
// Explicit per-record outcome of a pass, in log order, so callers can
// inspect and retry deliberately.

use serde::Serialize;

use super::remote::RemoteError;
use crate::log::{ChangeId, Operation};

/// Why a record stayed in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
    TimedOut,
    Cancelled,
    /// The remote accepted the change but the local acknowledgement failed.
    Local,
}

impl From<&RemoteError> for FailureClass {
    fn from(err: &RemoteError) -> Self {
        match err {
            RemoteError::Unavailable(_) => FailureClass::Transient,
            RemoteError::Rejected(_) => FailureClass::Permanent,
            RemoteError::TimedOut(_) => FailureClass::TimedOut,
            RemoteError::Cancelled => FailureClass::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChangeOutcome {
    /// Applied remotely and removed from the log.
    Synced,

    /// Left in the log for a later pass.
    Failed { class: FailureClass, reason: String },

    /// Not dispatched because an earlier record for the same key failed.
    Deferred { blocked_by: ChangeId },
}

impl ChangeOutcome {
    pub fn from_remote(err: &RemoteError) -> Self {
        ChangeOutcome::Failed {
            class: err.into(),
            reason: err.to_string(),
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, ChangeOutcome::Synced)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeResult {
    pub change_id: ChangeId,
    pub key: String,
    pub operation: Operation,
    pub outcome: ChangeOutcome,
}

/// Output of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub results: Vec<ChangeResult>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_synced())
    }

    pub fn synced(&self) -> impl Iterator<Item = &ChangeResult> {
        self.results.iter().filter(|r| r.outcome.is_synced())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ChangeResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ChangeOutcome::Failed { .. }))
    }

    pub fn deferred(&self) -> impl Iterator<Item = &ChangeResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ChangeOutcome::Deferred { .. }))
    }

    pub fn outcome_of(&self, change_id: ChangeId) -> Option<&ChangeOutcome> {
        self.results
            .iter()
            .find(|r| r.change_id == change_id)
            .map(|r| &r.outcome)
    }
}
