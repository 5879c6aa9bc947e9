use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::lock::{self, LockRecord};
use super::{ObjectKey, ObjectStore, StoreError, StoreResult, StoredObject};

#[derive(Default)]
struct Entry {
    body: Vec<u8>,
    lock: Option<LockRecord>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, HashMap<String, Entry>>,
    failing: HashSet<String>,
    latency: Duration,
}

/// In-process object store.
///
/// Lock expiry follows the tokio clock, so paused-time tests can step
/// through lease durations. Objects can be made to fail and every call can
/// be slowed down to exercise error and cancellation paths.
pub struct MemoryStore {
    origin: Instant,
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_container(container: &str) -> Self {
        let store = Self::new();
        store
            .state()
            .containers
            .insert(container.to_string(), HashMap::new());
        store
    }

    /// Every call touching an object with this name fails until cleared.
    pub fn fail_object(&self, name: &str) {
        self.state().failing.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Raw body of an object, bypassing locks.
    pub fn body(&self, key: &ObjectKey) -> Option<Vec<u8>> {
        self.state()
            .containers
            .get(&key.container)
            .and_then(|objects| objects.get(&key.name))
            .map(|entry| entry.body.clone())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Runs `f` against an existing object.
    fn with_entry<T>(
        &self,
        key: &ObjectKey,
        f: impl FnOnce(&mut Entry, u64) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let now_ms = self.now_ms();
        let mut state = self.state();
        let objects = objects_mut(&mut state, key)?;
        let entry = objects
            .get_mut(&key.name)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        f(entry, now_ms)
    }
}

fn objects_mut<'a>(
    state: &'a mut State,
    key: &ObjectKey,
) -> StoreResult<&'a mut HashMap<String, Entry>> {
    if state.failing.contains(&key.name) {
        return Err(StoreError::Backend(format!("injected failure for {key}")));
    }
    state
        .containers
        .get_mut(&key.container)
        .ok_or_else(|| StoreError::ContainerNotFound(key.container.clone()))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn container_exists(&self, container: &str) -> StoreResult<bool> {
        self.delay().await;
        Ok(self.state().containers.contains_key(container))
    }

    async fn create_container(&self, container: &str) -> StoreResult<()> {
        self.delay().await;
        self.state()
            .containers
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_container(&self, container: &str) -> StoreResult<()> {
        self.delay().await;
        match self.state().containers.remove(container) {
            Some(_) => Ok(()),
            None => Err(StoreError::ContainerNotFound(container.to_string())),
        }
    }

    async fn get(&self, key: &ObjectKey) -> StoreResult<StoredObject> {
        self.delay().await;
        self.with_entry(key, |entry, now_ms| {
            Ok(StoredObject {
                body: entry.body.clone(),
                lock_state: lock::lock_state(&entry.lock, now_ms),
            })
        })
    }

    async fn create_if_absent(&self, key: &ObjectKey, body: Vec<u8>) -> StoreResult<()> {
        self.delay().await;
        let mut state = self.state();
        let objects = objects_mut(&mut state, key)?;
        if objects.contains_key(&key.name) {
            return Err(StoreError::AlreadyExists(key.clone()));
        }
        objects.insert(key.name.clone(), Entry { body, lock: None });
        Ok(())
    }

    async fn overwrite(&self, key: &ObjectKey, body: Vec<u8>, lock_token: &str) -> StoreResult<()> {
        self.delay().await;
        self.with_entry(key, |entry, now_ms| {
            lock::check_write(&entry.lock, key, lock_token, now_ms)?;
            entry.body = body;
            Ok(())
        })
    }

    async fn acquire_lock(
        &self,
        key: &ObjectKey,
        token: &str,
        duration: Duration,
    ) -> StoreResult<()> {
        self.delay().await;
        self.with_entry(key, |entry, now_ms| {
            lock::acquire(&mut entry.lock, key, token, duration, now_ms)
        })
    }

    async fn break_lock(
        &self,
        key: &ObjectKey,
        current_token: &str,
        new_token: &str,
    ) -> StoreResult<()> {
        self.delay().await;
        self.with_entry(key, |entry, now_ms| {
            lock::change(&mut entry.lock, key, current_token, new_token, now_ms)
        })
    }

    async fn renew_lock(&self, key: &ObjectKey, token: &str) -> StoreResult<()> {
        self.delay().await;
        self.with_entry(key, |entry, now_ms| {
            lock::renew(&mut entry.lock, key, token, now_ms)
        })
    }

    async fn release_lock(&self, key: &ObjectKey, token: &str) -> StoreResult<()> {
        self.delay().await;
        self.with_entry(key, |entry, now_ms| {
            lock::release(&mut entry.lock, key, token, now_ms)
        })
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.delay().await;
        let now_ms = self.now_ms();
        let mut state = self.state();
        let objects = objects_mut(&mut state, key)?;
        let entry = objects
            .get(&key.name)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        lock::check_delete(&entry.lock, key, now_ms)?;
        objects.remove(&key.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseState;

    const DURATION: Duration = Duration::from_secs(30);

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("leases", name)
    }

    #[tokio::test]
    async fn create_is_exclusive() {
        let store = MemoryStore::with_container("leases");
        store
            .create_if_absent(&key("0"), b"first".to_vec())
            .await
            .expect("create");
        let err = store
            .create_if_absent(&key("0"), b"second".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.body(&key("0")).as_deref(), Some(&b"first"[..]));
    }

    #[tokio::test]
    async fn missing_container_and_object() {
        let store = MemoryStore::new();
        let err = store.get(&key("0")).await.unwrap_err();
        assert!(matches!(err, StoreError::ContainerNotFound(_)));

        store.create_container("leases").await.expect("create container");
        assert!(store.container_exists("leases").await.expect("exists"));
        let err = store.get(&key("0")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        store.delete_container("leases").await.expect("delete container");
        assert!(!store.container_exists("leases").await.expect("exists"));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_expires_on_the_tokio_clock() {
        let store = MemoryStore::with_container("leases");
        store
            .create_if_absent(&key("0"), Vec::new())
            .await
            .expect("create");
        store
            .acquire_lock(&key("0"), "a", DURATION)
            .await
            .expect("lock");
        assert_eq!(
            store.get(&key("0")).await.expect("get").lock_state,
            LeaseState::Locked
        );

        tokio::time::advance(DURATION + Duration::from_millis(1)).await;
        assert_eq!(
            store.get(&key("0")).await.expect("get").lock_state,
            LeaseState::Unlocked
        );
        store
            .acquire_lock(&key("0"), "b", DURATION)
            .await
            .expect("lock after expiry");
    }

    #[tokio::test]
    async fn overwrite_and_delete_respect_the_lock() {
        let store = MemoryStore::with_container("leases");
        store
            .create_if_absent(&key("0"), Vec::new())
            .await
            .expect("create");
        let err = store
            .overwrite(&key("0"), b"x".to_vec(), "a")
            .await
            .unwrap_err();
        assert!(err.is_contention());

        store
            .acquire_lock(&key("0"), "a", DURATION)
            .await
            .expect("lock");
        store
            .overwrite(&key("0"), b"x".to_vec(), "a")
            .await
            .expect("overwrite");
        let err = store.delete(&key("0")).await.unwrap_err();
        assert!(matches!(err, StoreError::LockHeld(_)));

        store.release_lock(&key("0"), "a").await.expect("release");
        store.delete(&key("0")).await.expect("delete");
        assert!(store.body(&key("0")).is_none());
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemoryStore::with_container("leases");
        store
            .create_if_absent(&key("0"), Vec::new())
            .await
            .expect("create");
        store.fail_object("0");
        let err = store.get(&key("0")).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(!err.is_contention());
        store.clear_failures();
        store.get(&key("0")).await.expect("get after clear");
    }
}
