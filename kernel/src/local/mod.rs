// Local Store Facade
//
// The only writer of entries and the change log. Every mutation produces
// exactly one change record, written in the same atomic store batch as
// the entry itself.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::log::{is_reserved_key, ChangeId, ChangeLog, ChangeRecord, LogError, NewChange};
use crate::store::{KvStore, StorageError};
use crate::sync::remote::{bounded, RemoteStore};

#[derive(Debug, thiserror::Error)]
pub enum LocalStoreError {
    #[error("key `{0}` is reserved for the change log")]
    ReservedKey(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("change log error: {0}")]
    Log(#[from] LogError),

    #[error("failed to serialize value for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stored value for `{key}` does not decode: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Remote read-through used when a key is missing locally.
#[derive(Clone)]
struct Fallback {
    remote: Arc<dyn RemoteStore>,
    timeout: Duration,
}

/// Handle to a local store. Clones share the same store and lock.
pub struct LocalStore<S: KvStore> {
    inner: Arc<Mutex<ChangeLog<S>>>,
    fallback: Option<Fallback>,
}

impl<S: KvStore> Clone for LocalStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            fallback: self.fallback.clone(),
        }
    }
}

impl<S: KvStore> LocalStore<S> {
    pub fn new(log: ChangeLog<S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(log)),
            fallback: None,
        }
    }

    /// Open the change log held in `store` and wrap it.
    pub fn open(store: S) -> Result<Self, LocalStoreError> {
        Ok(Self::new(ChangeLog::open(store)?))
    }

    /// Read through to `remote` for keys missing locally.
    pub fn with_fallback(mut self, remote: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
        self.fallback = Some(Fallback { remote, timeout });
        self
    }

    /// Store an already-serialized value.
    pub async fn set_raw(
        &self,
        key: &str,
        value: impl Into<String>,
    ) -> Result<ChangeRecord, LocalStoreError> {
        ensure_user_key(key)?;
        let value = value.into();

        let mut log = self.inner.lock().await;
        let change = match log.store().get(key)? {
            None => NewChange::insert(key, value),
            Some(old) => NewChange::update(key, old, value),
        };

        Ok(log.apply_and_append(change)?)
    }

    /// Serialize `value` as JSON and store it.
    pub async fn set_item<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<ChangeRecord, LocalStoreError> {
        let encoded = serde_json::to_string(value).map_err(|source| LocalStoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.set_raw(key, encoded).await
    }

    /// Read the serialized value, falling back to the remote if configured.
    ///
    /// A value fetched from the remote is cached locally without a change
    /// record. Remote failures are logged and reported as absent. While a
    /// change for `key` is still pending the local state is authoritative
    /// and the remote is not consulted.
    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        ensure_user_key(key)?;

        {
            let log = self.inner.lock().await;
            if let Some(value) = log.store().get(key)? {
                return Ok(Some(value));
            }
            if log.has_pending(key) {
                return Ok(None);
            }
        }

        match &self.fallback {
            Some(fallback) => self.fetch_and_cache(fallback, key).await,
            None => Ok(None),
        }
    }

    /// Read and decode a JSON value.
    pub async fn get_item<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, LocalStoreError> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| LocalStoreError::Decode {
                key: key.to_string(),
                source,
            })
    }

    /// Delete `key` and log the removal, whether or not it existed.
    pub async fn remove_item(&self, key: &str) -> Result<ChangeRecord, LocalStoreError> {
        ensure_user_key(key)?;

        let mut log = self.inner.lock().await;
        let previous = log.store().get(key)?;

        Ok(log.apply_and_append(NewChange::delete(key, previous))?)
    }

    /// User keys, sorted. Reserved keys are excluded.
    pub async fn keys(&self) -> Result<Vec<String>, LocalStoreError> {
        let keys = self.inner.lock().await.store().keys()?;
        Ok(keys.into_iter().filter(|k| !is_reserved_key(k)).collect())
    }

    /// Snapshot of outstanding change records in log order.
    pub async fn pending_changes(&self) -> Vec<ChangeRecord> {
        self.inner.lock().await.list().to_vec()
    }

    /// Remove an acknowledged record. `Ok(false)` if it was already gone.
    pub async fn acknowledge(&self, change_id: ChangeId) -> Result<bool, LogError> {
        self.inner.lock().await.remove_by_id(change_id)
    }

    /// Drop every outstanding record. For explicit resets only.
    pub async fn clear_changes(&self) -> Result<usize, LogError> {
        let cleared = self.inner.lock().await.clear()?;
        warn!(cleared, "Change log cleared");
        Ok(cleared)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn fetch_and_cache(
        &self,
        fallback: &Fallback,
        key: &str,
    ) -> Result<Option<String>, LocalStoreError> {
        // The lock is not held across the remote call.
        let fetched = bounded(fallback.timeout, fallback.remote.fetch(key)).await;

        let value = match fetched {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(error = %err, "Remote fetch failed; treating as absent");
                return Ok(None);
            }
        };

        let mut log = self.inner.lock().await;
        if log.has_pending(key) {
            // Written or removed locally while the fetch was in flight.
            return Ok(log.store().get(key)?);
        }
        if let Some(local) = log.store().get(key)? {
            return Ok(Some(local));
        }
        log.store_mut().put(key, &value)?;
        debug!("Cached remote value");

        Ok(Some(value))
    }
}

fn ensure_user_key(key: &str) -> Result<(), LocalStoreError> {
    if is_reserved_key(key) {
        Err(LocalStoreError::ReservedKey(key.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Operation, CHANGE_LOG_KEY};
    use crate::store::testing::FailingStore;
    use crate::store::MemoryKvStore;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::collections::HashMap;

    fn local() -> LocalStore<MemoryKvStore> {
        LocalStore::open(MemoryKvStore::new()).unwrap()
    }

    struct FixedRemote {
        values: HashMap<String, String>,
        fail: bool,
    }

    #[async_trait]
    impl RemoteStore for FixedRemote {
        async fn upsert(&self, _key: &str, _value: &str) -> Result<(), crate::sync::RemoteError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<(), crate::sync::RemoteError> {
            Ok(())
        }

        async fn fetch(&self, key: &str) -> Result<Option<String>, crate::sync::RemoteError> {
            if self.fail {
                return Err(crate::sync::RemoteError::unavailable("offline"));
            }
            Ok(self.values.get(key).cloned())
        }

        async fn upload_change_log(
            &self,
            _changes: &[ChangeRecord],
        ) -> Result<(), crate::sync::RemoteError> {
            Ok(())
        }
    }

    fn remote_with(key: &str, value: &str, fail: bool) -> Arc<dyn RemoteStore> {
        Arc::new(FixedRemote {
            values: HashMap::from([(key.to_string(), value.to_string())]),
            fail,
        })
    }

    #[tokio::test]
    async fn set_get_remove_scenario() {
        let store = local();

        let first = store.set_raw("apiKey", "v1").await.unwrap();
        assert_eq!(first.change_id, 1);
        assert_eq!(first.operation, Operation::Insert);
        assert_eq!(first.old_value, None);
        assert_eq!(first.new_value.as_deref(), Some("v1"));

        let second = store.set_raw("apiKey", "v2").await.unwrap();
        assert_eq!(second.change_id, 2);
        assert_eq!(second.operation, Operation::Update);
        assert_eq!(second.old_value.as_deref(), Some("v1"));
        assert_eq!(second.new_value.as_deref(), Some("v2"));

        let third = store.remove_item("apiKey").await.unwrap();
        assert_eq!(third.change_id, 3);
        assert_eq!(third.operation, Operation::Delete);
        assert_eq!(third.old_value.as_deref(), Some("v2"));
        assert_eq!(third.new_value, None);

        assert_eq!(store.get_raw("apiKey").await.unwrap(), None);
        assert_eq!(store.pending_changes().await, vec![first, second, third]);
    }

    #[tokio::test]
    async fn identical_writes_still_log_updates() {
        let store = local();
        store.set_raw("k", "same").await.unwrap();
        let again = store.set_raw("k", "same").await.unwrap();

        assert_eq!(again.operation, Operation::Update);
        assert_eq!(store.pending_changes().await.len(), 2);
    }

    #[tokio::test]
    async fn removing_absent_key_logs_delete_without_old_value() {
        let store = local();
        let record = store.remove_item("ghost").await.unwrap();

        assert_eq!(record.operation, Operation::Delete);
        assert_eq!(record.old_value, None);
    }

    #[tokio::test]
    async fn typed_values_round_trip_through_json() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Folder {
            id: String,
            name: String,
        }

        let store = local();
        let folders = vec![Folder {
            id: "f1".into(),
            name: "Work".into(),
        }];
        store.set_item("folders", &folders).await.unwrap();

        let loaded: Vec<Folder> = store.get_item("folders").await.unwrap().unwrap();
        assert_eq!(loaded, folders);

        store.set_raw("broken", "{").await.unwrap();
        let err = store.get_item::<Vec<Folder>>("broken").await.unwrap_err();
        assert!(matches!(err, LocalStoreError::Decode { .. }));
    }

    #[tokio::test]
    async fn reserved_keys_are_refused() {
        let store = local();
        assert!(matches!(
            store.set_raw(CHANGE_LOG_KEY, "[]").await,
            Err(LocalStoreError::ReservedKey(_))
        ));
        assert!(matches!(
            store.get_raw(CHANGE_LOG_KEY).await,
            Err(LocalStoreError::ReservedKey(_))
        ));

        store.set_raw("apiKey", "v1").await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["apiKey".to_string()]);
    }

    #[tokio::test]
    async fn remote_fill_is_cached_without_change_record() {
        let store = local().with_fallback(
            remote_with("prompts", "[1]", false),
            Duration::from_secs(1),
        );

        assert_eq!(store.get_raw("prompts").await.unwrap().as_deref(), Some("[1]"));
        assert!(store.pending_changes().await.is_empty());
        assert_eq!(store.keys().await.unwrap(), vec!["prompts".to_string()]);

        // Later writes see the cached value as prior state.
        let record = store.set_raw("prompts", "[2]").await.unwrap();
        assert_eq!(record.operation, Operation::Update);
        assert_eq!(record.old_value.as_deref(), Some("[1]"));
    }

    #[tokio::test]
    async fn remote_fetch_failure_reads_as_absent() {
        let store = local().with_fallback(
            remote_with("prompts", "[1]", true),
            Duration::from_secs(1),
        );

        assert_eq!(store.get_raw("prompts").await.unwrap(), None);
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_delete_is_not_undone_by_remote_read() {
        let store = local().with_fallback(
            remote_with("prompts", "[1]", false),
            Duration::from_secs(1),
        );
        store.set_raw("prompts", "[1]").await.unwrap();
        store.acknowledge(1).await.unwrap();

        store.remove_item("prompts").await.unwrap();

        assert_eq!(store.get_raw("prompts").await.unwrap(), None);
        assert!(store.keys().await.unwrap().is_empty());
        assert_eq!(store.pending_changes().await.len(), 1);
    }

    #[tokio::test]
    async fn crash_during_set_leaves_no_unlogged_entry() {
        use crate::store::testing::CrashingStore;
        use crate::store::FileKvStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvledger.json");

        // Crashes on any write that touches the log list on its own; a
        // single batched write trips it before anything reaches disk.
        let store = LocalStore::open(CrashingStore {
            inner: FileKvStore::open(&path).unwrap(),
            crash_on: CHANGE_LOG_KEY,
        })
        .unwrap();

        let task = tokio::spawn(async move { store.set_raw("apiKey", "v1").await });
        assert!(task.await.unwrap_err().is_panic());

        let reopened = LocalStore::open(FileKvStore::open(&path).unwrap()).unwrap();
        assert_eq!(reopened.get_raw("apiKey").await.unwrap(), None);
        assert!(reopened.pending_changes().await.is_empty());
    }

    #[tokio::test]
    async fn failed_append_leaves_no_entry() {
        let store = LocalStore::open(FailingStore::failing_on(&[CHANGE_LOG_KEY])).unwrap();

        let err = store.set_raw("apiKey", "v1").await.unwrap_err();
        assert!(matches!(err, LocalStoreError::Log(LogError::Storage(_))));
        assert_eq!(store.get_raw("apiKey").await.unwrap(), None);
        assert!(store.pending_changes().await.is_empty());
    }

    #[tokio::test]
    async fn failed_delete_append_keeps_value() {
        let mut backing = FailingStore::default();
        backing.inner.put("apiKey", "v1").unwrap();
        backing.refuse(CHANGE_LOG_KEY);
        let store = LocalStore::open(backing).unwrap();

        assert!(store.remove_item("apiKey").await.is_err());
        assert_eq!(store.get_raw("apiKey").await.unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn entry_write_failure_appends_nothing() {
        let store = LocalStore::open(FailingStore::failing_on(&["apiKey"])).unwrap();

        let err = store.set_raw("apiKey", "v1").await.unwrap_err();
        assert!(matches!(err, LocalStoreError::Log(LogError::Storage(_))));
        assert_eq!(store.get_raw("apiKey").await.unwrap(), None);
        assert!(store.pending_changes().await.is_empty());
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let store = local();
        let record = store.set_raw("k", "v").await.unwrap();

        assert!(store.acknowledge(record.change_id).await.unwrap());
        assert!(!store.acknowledge(record.change_id).await.unwrap());
        assert!(store.pending_changes().await.is_empty());
        assert_eq!(store.get_raw("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn clones_share_one_log() {
        let store = local();
        let other = store.clone();

        let a = tokio::spawn({
            let store = store.clone();
            async move {
                for i in 0..20 {
                    store.set_raw("a", i.to_string()).await.unwrap();
                }
            }
        });
        let b = tokio::spawn(async move {
            for i in 0..20 {
                other.set_raw("b", i.to_string()).await.unwrap();
            }
        });
        a.await.unwrap();
        b.await.unwrap();

        let ids: Vec<_> = store
            .pending_changes()
            .await
            .iter()
            .map(|r| r.change_id)
            .collect();
        assert_eq!(ids, (1..=40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvledger.json");

        {
            let store = LocalStore::open(crate::store::FileKvStore::open(&path).unwrap()).unwrap();
            store.set_raw("apiKey", "v1").await.unwrap();
            store.set_raw("apiKey", "v2").await.unwrap();
        }

        let store = LocalStore::open(crate::store::FileKvStore::open(&path).unwrap()).unwrap();
        assert_eq!(store.get_raw("apiKey").await.unwrap().as_deref(), Some("v2"));
        let changes = store.pending_changes().await;
        assert_eq!(changes.len(), 2);
        assert_eq!(store.remove_item("apiKey").await.unwrap().change_id, 3);
    }
}
