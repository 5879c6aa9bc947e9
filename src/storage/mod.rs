//! Durable object store capability.
//!
//! The lease manager only talks to storage through [`ObjectStore`]. Every
//! mutation is conditional: creates fail when the object exists, overwrites
//! require the current lock token, and locks expire unless renewed.

#[cfg(feature = "fs")]
mod fs;
mod lock;
mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::lease::LeaseState;

#[cfg(feature = "fs")]
pub use fs::FsStore;
pub use memory::MemoryStore;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub container: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub lock_state: LeaseState,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("object not found: {0}")]
    NotFound(ObjectKey),
    #[error("object already exists: {0}")]
    AlreadyExists(ObjectKey),
    #[error("object is locked by another holder: {0}")]
    LockHeld(ObjectKey),
    #[error("lock token does not match: {0}")]
    LockMismatch(ObjectKey),
    #[error("object has no active lock: {0}")]
    LockNotHeld(ObjectKey),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Another holder's token won a conditional write or lock race.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StoreError::LockHeld(_) | StoreError::LockMismatch(_) | StoreError::LockNotHeld(_)
        )
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn container_exists(&self, container: &str) -> StoreResult<bool>;

    async fn create_container(&self, container: &str) -> StoreResult<()>;

    async fn delete_container(&self, container: &str) -> StoreResult<()>;

    async fn get(&self, key: &ObjectKey) -> StoreResult<StoredObject>;

    /// Fails with `AlreadyExists` if the object is present.
    async fn create_if_absent(&self, key: &ObjectKey, body: Vec<u8>) -> StoreResult<()>;

    /// Replaces the body; the object must be locked with `lock_token`.
    async fn overwrite(&self, key: &ObjectKey, body: Vec<u8>, lock_token: &str) -> StoreResult<()>;

    async fn acquire_lock(&self, key: &ObjectKey, token: &str, duration: Duration)
        -> StoreResult<()>;

    /// Swaps the active lock from `current_token` to `new_token`.
    async fn break_lock(
        &self,
        key: &ObjectKey,
        current_token: &str,
        new_token: &str,
    ) -> StoreResult<()>;

    async fn renew_lock(&self, key: &ObjectKey, token: &str) -> StoreResult<()>;

    async fn release_lock(&self, key: &ObjectKey, token: &str) -> StoreResult<()>;

    /// Fails with `LockHeld` while the object is locked.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;
}
