// Change Log Persistence Layout
//
// The log shares the durable store with the entries it describes:
// - `__CHANGE_LOG__` holds every outstanding record as one JSON array
// - `__CHANGE_LOG_SEQ__` holds the highest id ever assigned
//
// Both keys are reserved; the facade refuses to read or write them.

use super::{ChangeId, ChangeRecord, LogError};
use crate::store::KvStore;

pub const CHANGE_LOG_KEY: &str = "__CHANGE_LOG__";
pub const CHANGE_SEQ_KEY: &str = "__CHANGE_LOG_SEQ__";

/// True for keys owned by the change log.
pub fn is_reserved_key(key: &str) -> bool {
    key == CHANGE_LOG_KEY || key == CHANGE_SEQ_KEY
}

pub(super) fn load_records<S: KvStore>(store: &S) -> Result<Vec<ChangeRecord>, LogError> {
    match store.get(CHANGE_LOG_KEY)? {
        Some(raw) => serde_json::from_str(&raw).map_err(|source| LogError::Decode {
            key: CHANGE_LOG_KEY,
            source,
        }),
        None => Ok(Vec::new()),
    }
}

/// Encoded list, or `None` when the list key should be removed.
pub(super) fn encode_records(records: &[ChangeRecord]) -> Result<Option<String>, LogError> {
    if records.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(records)
        .map(Some)
        .map_err(LogError::Encode)
}

pub(super) fn save_records<S: KvStore>(
    store: &mut S,
    records: &[ChangeRecord],
) -> Result<(), LogError> {
    let encoded = encode_records(records)?;
    store.apply(&[(CHANGE_LOG_KEY, encoded.as_deref())])?;
    Ok(())
}

pub(super) fn clear_records<S: KvStore>(store: &mut S) -> Result<(), LogError> {
    store.delete(CHANGE_LOG_KEY)?;
    Ok(())
}

pub(super) fn load_high_water<S: KvStore>(store: &S) -> Result<ChangeId, LogError> {
    match store.get(CHANGE_SEQ_KEY)? {
        Some(raw) => serde_json::from_str(&raw).map_err(|source| LogError::Decode {
            key: CHANGE_SEQ_KEY,
            source,
        }),
        None => Ok(0),
    }
}
