//! Partition leases and checkpoints over a durable object store.
//!
//! A [`LeaseManager`] gives one process time-bound exclusive ownership of
//! stream partitions and tracks how far it has processed each of them.
//! Leases live as one object per partition in an [`ObjectStore`] container;
//! ownership is enforced by the store's object locks, and checkpoint
//! progress is buffered in memory and flushed by a background persister.

pub mod cache;
pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod lease;
pub mod manager;
mod persister;
pub mod storage;
mod trace;

pub use cache::LeaseCache;
pub use checkpoint::DirtySet;
pub use error::{Error, Result};
pub use lease::{Checkpoint, Lease, LeaseState, END_OF_STREAM_OFFSET, START_OF_STREAM_OFFSET};
pub use manager::{LeaseConfig, LeaseManager, PartitionHost};
#[cfg(feature = "fs")]
pub use storage::FsStore;
pub use storage::{MemoryStore, ObjectKey, ObjectStore, StoreError, StoredObject};
pub use tokio_util::sync::CancellationToken;
