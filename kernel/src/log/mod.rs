use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::store::{KvStore, Mutation, StorageError};

pub mod store;

pub use store::{is_reserved_key, CHANGE_LOG_KEY, CHANGE_SEQ_KEY};

/// Identifier of a change record. Strictly increasing, never reused.
pub type ChangeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One local mutation intent awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub change_id: ChangeId,
    pub key: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    /// Epoch milliseconds. Diagnostic only; log order is authoritative.
    pub timestamp: i64,
}

/// A change record before the log assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChange {
    pub key: String,
    pub operation: Operation,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl NewChange {
    pub fn insert(key: impl Into<String>, new_value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Insert,
            old_value: None,
            new_value: Some(new_value.into()),
        }
    }

    pub fn update(
        key: impl Into<String>,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Update,
            old_value: Some(old_value.into()),
            new_value: Some(new_value.into()),
        }
    }

    pub fn delete(key: impl Into<String>, old_value: Option<String>) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Delete,
            old_value,
            new_value: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("corrupt change log: {0}")]
    Corrupt(#[source] InvariantViolation),

    #[error("rejected change: {0}")]
    Rejected(#[source] InvariantViolation),

    #[error("undecodable change log under `{key}`: {source}")]
    Decode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode change log: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Append-only change log persisted inside a [`KvStore`].
///
/// The log owns its store; entries and the log share one durable medium.
/// Every mutation is write-through: the new list is persisted before the
/// in-memory copy changes, so a failed write leaves the log untouched.
#[derive(Debug)]
pub struct ChangeLog<S: KvStore> {
    store: S,
    records: Vec<ChangeRecord>,
    high_water: ChangeId,
    last_timestamp: i64,
    invariants: InvariantEngine,
}

impl<S: KvStore> ChangeLog<S> {
    /// Open the log held in `store`, validating any persisted records.
    pub fn open(store: S) -> Result<Self, LogError> {
        let records = store::load_records(&store)?;
        let invariants = InvariantEngine::standard();
        invariants.check_all(&records).map_err(LogError::Corrupt)?;

        let persisted_seq = store::load_high_water(&store)?;
        let last_id = records.last().map(|r| r.change_id).unwrap_or(0);
        let last_timestamp = records.iter().map(|r| r.timestamp).max().unwrap_or(0);

        debug!(records = records.len(), last_id, "Opened change log");

        Ok(Self {
            store,
            records,
            high_water: persisted_seq.max(last_id),
            last_timestamp,
            invariants,
        })
    }

    /// Assign the next id and durably append.
    ///
    /// Ids continue from the highest ever assigned, so a drained or cleared
    /// log does not restart at 1; an id is never handed out twice.
    pub fn append(&mut self, change: NewChange) -> Result<ChangeRecord, LogError> {
        self.commit(change, false)
    }

    /// Apply `change` to its entry and append the record in one atomic write.
    ///
    /// Upserts put `new_value` under the key, deletes remove it. Either the
    /// entry and its record are both durable, or neither is.
    pub fn apply_and_append(&mut self, change: NewChange) -> Result<ChangeRecord, LogError> {
        self.commit(change, true)
    }

    fn commit(&mut self, change: NewChange, write_entry: bool) -> Result<ChangeRecord, LogError> {
        let change_id = self.next_change_id();
        let record = ChangeRecord {
            change_id,
            key: change.key,
            operation: change.operation,
            old_value: change.old_value,
            new_value: change.new_value,
            timestamp: self.next_timestamp(),
        };

        self.invariants
            .evaluate(self.records.last(), &record)
            .map_err(LogError::Rejected)?;

        let mut next = self.records.clone();
        next.push(record.clone());
        let encoded = store::encode_records(&next)?;
        let seq = change_id.to_string();

        let mut batch: Vec<Mutation<'_>> = Vec::with_capacity(3);
        if write_entry {
            batch.push((record.key.as_str(), record.new_value.as_deref()));
        }
        batch.push((CHANGE_SEQ_KEY, Some(seq.as_str())));
        batch.push((CHANGE_LOG_KEY, encoded.as_deref()));
        self.store.apply(&batch)?;

        self.high_water = change_id;
        self.records = next;
        self.last_timestamp = record.timestamp;

        debug!(
            change_id,
            key = %record.key,
            operation = ?record.operation,
            "Appended change"
        );

        Ok(record)
    }

    /// True while an un-reconciled record for `key` is in the log.
    pub fn has_pending(&self, key: &str) -> bool {
        self.records.iter().any(|r| r.key == key)
    }

    /// All un-reconciled records in append order.
    pub fn list(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn get(&self, change_id: ChangeId) -> Option<&ChangeRecord> {
        self.records.iter().find(|r| r.change_id == change_id)
    }

    /// Remove a record by id. Returns `false` if it was already gone.
    pub fn remove_by_id(&mut self, change_id: ChangeId) -> Result<bool, LogError> {
        let Some(index) = self.records.iter().position(|r| r.change_id == change_id) else {
            return Ok(false);
        };

        let mut next = self.records.clone();
        next.remove(index);
        store::save_records(&mut self.store, &next)?;
        self.records = next;

        debug!(change_id, remaining = self.records.len(), "Removed change");
        Ok(true)
    }

    /// Drop every record. The id high-water mark is kept.
    pub fn clear(&mut self) -> Result<usize, LogError> {
        let cleared = self.records.len();
        store::clear_records(&mut self.store)?;
        self.records.clear();
        Ok(cleared)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_change_id(&self) -> Option<ChangeId> {
        self.records.last().map(|r| r.change_id)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn next_change_id(&self) -> ChangeId {
        self.high_water.max(self.last_change_id().unwrap_or(0)) + 1
    }

    fn next_timestamp(&self) -> i64 {
        chrono::Utc::now().timestamp_millis().max(self.last_timestamp)
    }
}
