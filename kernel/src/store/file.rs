// File-backed store.
//
// The whole map is kept in memory and rewritten atomically on every
// mutation: write a sibling temp file, fsync it, rename over the target.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{KvStore, Mutation, StorageError};

#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileKvStore {
    /// Open the store at `path`, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = if path.exists() {
            let data = fs::read_to_string(&path)?;
            if data.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&data).map_err(|source| StorageError::Corrupt {
                    path: path.display().to_string(),
                    source,
                })?
            }
        } else {
            BTreeMap::new()
        };

        info!(path = %path.display(), entries = entries.len(), "Opened file store");

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec_pretty(&self.entries)?;
        let temp_path = self.path.with_extension("json.tmp");

        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        // Make the rename itself durable.
        #[cfg(unix)]
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                File::open(parent)?.sync_all()?;
            }
        }

        debug!(path = %self.path.display(), bytes = encoded.len(), "Persisted store");
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.apply(&[(key, Some(value))])
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        if !self.entries.contains_key(key) {
            return Ok(());
        }
        self.apply(&[(key, None)])
    }

    /// The whole batch lands in one rename, so a crash leaves either the
    /// old file or the new one.
    fn apply(&mut self, batch: &[Mutation<'_>]) -> Result<(), StorageError> {
        let mut undo = Vec::with_capacity(batch.len());
        for (key, value) in batch {
            let previous = match value {
                Some(value) => self.entries.insert(key.to_string(), value.to_string()),
                None => self.entries.remove(*key),
            };
            undo.push((key.to_string(), previous));
        }

        if let Err(err) = self.persist() {
            for (key, previous) in undo.into_iter().rev() {
                match previous {
                    Some(previous) => self.entries.insert(key, previous),
                    None => self.entries.remove(&key),
                };
            }
            return Err(err);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.keys().cloned().collect())
    }
}
