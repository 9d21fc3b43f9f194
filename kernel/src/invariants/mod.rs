// Change Log Invariants
//
// Pure rules every record must satisfy relative to the record before it.
// Checked on append and when a persisted log is opened, so a damaged
// log is detected before any record is replayed against the remote.

use std::fmt;

use crate::log::{ChangeId, ChangeRecord, Operation};

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, previous: Option<&ChangeRecord>, record: &ChangeRecord) -> InvariantResult;
}

/// Ids are positive and strictly increasing in log order.
pub struct StrictlyIncreasingIds;

impl Invariant for StrictlyIncreasingIds {
    fn name(&self) -> &'static str {
        "strictly-increasing-ids"
    }

    fn validate(&self, previous: Option<&ChangeRecord>, record: &ChangeRecord) -> InvariantResult {
        let floor = previous.map(|p| p.change_id).unwrap_or(0);
        if record.change_id > floor {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail(format!(
                "id {} does not follow {}",
                record.change_id, floor
            ))
        }
    }
}

/// Value presence matches the operation.
pub struct OperationShape;

impl Invariant for OperationShape {
    fn name(&self) -> &'static str {
        "operation-shape"
    }

    fn validate(&self, _previous: Option<&ChangeRecord>, record: &ChangeRecord) -> InvariantResult {
        let problem = match record.operation {
            Operation::Insert if record.old_value.is_some() => Some("INSERT carries an old value"),
            Operation::Insert | Operation::Update if record.new_value.is_none() => {
                Some("upsert has no new value")
            }
            Operation::Update if record.old_value.is_none() => Some("UPDATE has no old value"),
            Operation::Delete if record.new_value.is_some() => Some("DELETE carries a new value"),
            _ => None,
        };

        match problem {
            Some(reason) => InvariantResult::Fail(reason.into()),
            None => InvariantResult::Pass,
        }
    }
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl fmt::Debug for InvariantEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.invariants.iter().map(|i| i.name()))
            .finish()
    }
}

impl InvariantEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with the rules every change log enforces.
    pub fn standard() -> Self {
        let mut engine = Self::new();
        engine.register(StrictlyIncreasingIds);
        engine.register(OperationShape);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants for one record.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: Option<&ChangeRecord>,
        record: &ChangeRecord,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            if let InvariantResult::Fail(reason) = invariant.validate(previous, record) {
                return Err(InvariantViolation {
                    invariant: invariant.name(),
                    change_id: record.change_id,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Evaluate a whole log in order.
    pub fn check_all(&self, records: &[ChangeRecord]) -> Result<(), InvariantViolation> {
        let mut previous = None;
        for record in records {
            self.evaluate(previous, record)?;
            previous = Some(record);
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, thiserror::Error)]
#[error("invariant `{invariant}` violated at change {change_id}: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub change_id: ChangeId,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        change_id: ChangeId,
        operation: Operation,
        old: Option<&str>,
        new: Option<&str>,
    ) -> ChangeRecord {
        ChangeRecord {
            change_id,
            key: "apiKey".into(),
            operation,
            old_value: old.map(Into::into),
            new_value: new.map(Into::into),
            timestamp: 0,
        }
    }

    #[test]
    fn standard_engine_accepts_well_formed_log() {
        let log = vec![
            record(1, Operation::Insert, None, Some("v1")),
            record(2, Operation::Update, Some("v1"), Some("v2")),
            record(5, Operation::Delete, Some("v2"), None),
            record(6, Operation::Delete, None, None),
        ];

        InvariantEngine::standard().check_all(&log).unwrap();
    }

    #[test]
    fn out_of_order_ids_are_flagged() {
        let log = vec![
            record(2, Operation::Insert, None, Some("v1")),
            record(2, Operation::Update, Some("v1"), Some("v2")),
        ];

        let err = InvariantEngine::standard().check_all(&log).unwrap_err();
        assert_eq!(err.invariant, "strictly-increasing-ids");
        assert_eq!(err.change_id, 2);
    }

    #[test]
    fn zero_id_is_flagged() {
        let err = InvariantEngine::standard()
            .evaluate(None, &record(0, Operation::Insert, None, Some("v")))
            .unwrap_err();
        assert!(err.to_string().contains("strictly-increasing-ids"));
    }

    #[test]
    fn shape_violations_are_flagged() {
        let engine = InvariantEngine::standard();

        for bad in [
            record(1, Operation::Insert, Some("old"), Some("v")),
            record(1, Operation::Update, None, Some("v")),
            record(1, Operation::Update, Some("old"), None),
            record(1, Operation::Delete, None, Some("v")),
        ] {
            let err = engine.evaluate(None, &bad).unwrap_err();
            assert_eq!(err.invariant, "operation-shape");
        }
    }

    #[test]
    fn empty_engine_passes_everything() {
        InvariantEngine::new()
            .evaluate(None, &record(0, Operation::Delete, None, Some("v")))
            .unwrap();
    }
}
