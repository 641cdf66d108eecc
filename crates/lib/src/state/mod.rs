//! Persisted build state: signature records, the state lock and staleness.

mod lock;
mod staleness;
mod storage;
mod types;

pub use lock::{LockMetadata, LockMode, StateLock, StoreLockError};
pub use staleness::{DependencyState, StaleReason, direct_staleness};
pub use storage::SignatureStore;
pub use types::{DependencyRecord, SignatureRecord, StoreError};
