// KvLedger Kernel
//
// Local-first key/value store with an append-only change log and a
// reconciler that replays logged changes against a remote service of record.

pub mod adapters;
pub mod config;
pub mod invariants;
pub mod local;
pub mod log;
pub mod store;
pub mod sync;

pub use config::{ConfigError, StoreConfig, SyncConfig};
pub use local::{LocalStore, LocalStoreError};
pub use log::{ChangeId, ChangeLog, ChangeRecord, LogError, NewChange, Operation};
pub use store::{FileKvStore, KvStore, MemoryKvStore, StorageError};
pub use sync::{
    ChangeOutcome, ReconcileError, Reconciler, RemoteError, RemoteStore, SyncReport, SyncState,
};
