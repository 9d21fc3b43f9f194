// Durable Key/Value Store
//
// Thin persistent map from string key to serialized value.
// Values are opaque at this layer; structured typing belongs to callers.

use std::collections::BTreeMap;

pub mod file;

pub use file::FileKvStore;

/// Errors raised by a storage backend.
///
/// Any of these is a local durability failure and must reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// One write in a batch: `Some(value)` puts, `None` deletes.
pub type Mutation<'a> = (&'a str, Option<&'a str>);

/// Storage backend for entries and the change log.
///
/// Properties required from implementations:
/// - `get` on an absent key returns `Ok(None)`
/// - `put`, `delete` and `apply` are durable once they return `Ok`
/// - `delete` of an absent key is a successful no-op
/// - `apply` is all-or-nothing, including across a crash
pub trait KvStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn put(&mut self, key: &str, value: &str) -> Result<(), StorageError>;

    fn delete(&mut self, key: &str) -> Result<(), StorageError>;

    /// Apply every mutation in `batch` atomically, in order.
    fn apply(&mut self, batch: &[Mutation<'_>]) -> Result<(), StorageError>;

    /// All stored keys, sorted.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-memory store. Durable only for the life of the value.
#[derive(Debug, Default, Clone)]
pub struct MemoryKvStore {
    entries: BTreeMap<String, String>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    fn apply(&mut self, batch: &[Mutation<'_>]) -> Result<(), StorageError> {
        for (key, value) in batch {
            match value {
                Some(value) => self.entries.insert(key.to_string(), value.to_string()),
                None => self.entries.remove(*key),
            };
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.keys().cloned().collect())
    }
}

impl<T: KvStore + ?Sized> KvStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).put(key, value)
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        (**self).delete(key)
    }

    fn apply(&mut self, batch: &[Mutation<'_>]) -> Result<(), StorageError> {
        (**self).apply(batch)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        (**self).keys()
    }
}
