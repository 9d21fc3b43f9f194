// Mirror Remote Adapter
//
// A `RemoteStore` backed by any `KvStore`. Stands in for the service of
// record when it is another directory on disk, and gives tests a remote
// with real last-write-wins semantics.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::log::ChangeRecord;
use crate::store::{KvStore, StorageError};
use crate::sync::{RemoteError, RemoteStore};

/// Reserved key under which uploaded change-log batches accumulate.
pub const UPLOADED_CHANGE_LOG_KEY: &str = "__UPLOADED_CHANGE_LOG__";

pub struct MirrorRemote<S: KvStore> {
    store: Mutex<S>,
}

impl<S: KvStore> MirrorRemote<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    /// Every record received through `upload_change_log`, oldest first.
    pub async fn uploaded_changes(&self) -> Result<Vec<ChangeRecord>, RemoteError> {
        let store = self.store.lock().await;
        read_uploaded(&*store)
    }

    pub fn into_inner(self) -> S {
        self.store.into_inner()
    }
}

fn unavailable(err: StorageError) -> RemoteError {
    RemoteError::unavailable(err.to_string())
}

fn ensure_data_key(key: &str) -> Result<(), RemoteError> {
    if key == UPLOADED_CHANGE_LOG_KEY {
        Err(RemoteError::rejected(format!("key `{key}` is reserved")))
    } else {
        Ok(())
    }
}

fn read_uploaded<S: KvStore>(store: &S) -> Result<Vec<ChangeRecord>, RemoteError> {
    match store.get(UPLOADED_CHANGE_LOG_KEY).map_err(unavailable)? {
        Some(raw) => {
            serde_json::from_str(&raw).map_err(|e| RemoteError::unavailable(e.to_string()))
        }
        None => Ok(Vec::new()),
    }
}

#[async_trait]
impl<S: KvStore + 'static> RemoteStore for MirrorRemote<S> {
    async fn upsert(&self, key: &str, value: &str) -> Result<(), RemoteError> {
        ensure_data_key(key)?;
        self.store.lock().await.put(key, value).map_err(unavailable)?;
        debug!(key, "Mirror upsert");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        ensure_data_key(key)?;
        self.store.lock().await.delete(key).map_err(unavailable)?;
        debug!(key, "Mirror delete");
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<String>, RemoteError> {
        ensure_data_key(key)?;
        self.store.lock().await.get(key).map_err(unavailable)
    }

    async fn upload_change_log(&self, changes: &[ChangeRecord]) -> Result<(), RemoteError> {
        let mut store = self.store.lock().await;
        let mut uploaded = read_uploaded(&*store)?;
        uploaded.extend_from_slice(changes);

        let encoded =
            serde_json::to_string(&uploaded).map_err(|e| RemoteError::rejected(e.to_string()))?;
        store
            .put(UPLOADED_CHANGE_LOG_KEY, &encoded)
            .map_err(unavailable)?;

        debug!(received = changes.len(), total = uploaded.len(), "Mirror stored change log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Operation;
    use crate::store::{FileKvStore, MemoryKvStore};

    #[tokio::test]
    async fn upsert_and_delete_are_idempotent() {
        let mirror = MirrorRemote::new(MemoryKvStore::new());

        mirror.upsert("apiKey", "v1").await.unwrap();
        mirror.upsert("apiKey", "v1").await.unwrap();
        assert_eq!(mirror.fetch("apiKey").await.unwrap().as_deref(), Some("v1"));

        mirror.delete("apiKey").await.unwrap();
        mirror.delete("apiKey").await.unwrap();
        assert_eq!(mirror.fetch("apiKey").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reserved_key_is_rejected() {
        let mirror = MirrorRemote::new(MemoryKvStore::new());
        let err = mirror.upsert(UPLOADED_CHANGE_LOG_KEY, "[]").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn uploads_accumulate_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.json");
        let record = ChangeRecord {
            change_id: 1,
            key: "apiKey".into(),
            operation: Operation::Insert,
            old_value: None,
            new_value: Some("v1".into()),
            timestamp: 0,
        };

        {
            let mirror = MirrorRemote::new(FileKvStore::open(&path).unwrap());
            mirror.upload_change_log(&[record.clone()]).await.unwrap();
            mirror.upload_change_log(&[record.clone()]).await.unwrap();
        }

        let mirror = MirrorRemote::new(FileKvStore::open(&path).unwrap());
        let uploaded = mirror.uploaded_changes().await.unwrap();
        assert_eq!(uploaded, vec![record.clone(), record]);
    }
}
