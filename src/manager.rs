//! Lease acquisition, renewal and release against an [`ObjectStore`].

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::LeaseCache;
use crate::checkpoint::DirtySet;
use crate::codec;
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseState};
use crate::persister::Persister;
use crate::storage::{ObjectKey, ObjectStore, StoreError};
use crate::trace::store_call;

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_PERSIST_INITIAL_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(20);

/// The stream-processing host a manager works for.
pub trait PartitionHost: Send + Sync + 'static {
    /// Identity written as the owner of acquired leases.
    fn name(&self) -> String;

    fn partition_ids(&self) -> Vec<String>;
}

#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// Store container holding one lease object per partition.
    pub container: String,
    pub lease_duration: Duration,
    /// Deadline for each individual store call.
    pub store_timeout: Duration,
    pub persist_initial_delay: Duration,
    pub persist_interval: Duration,
    /// Deadline for one partition's flush within a persist cycle.
    pub flush_timeout: Duration,
}

impl LeaseConfig {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            persist_initial_delay: DEFAULT_PERSIST_INITIAL_DELAY,
            persist_interval: DEFAULT_PERSIST_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.container.is_empty() {
            return Err(Error::InvalidConfig("container name cannot be empty"));
        }
        if self.lease_duration.is_zero() {
            return Err(Error::InvalidConfig("lease duration must be positive"));
        }
        if self.store_timeout.is_zero() || self.flush_timeout.is_zero() {
            return Err(Error::InvalidConfig("store timeouts must be positive"));
        }
        if self.persist_interval.is_zero() {
            return Err(Error::InvalidConfig("persist interval must be positive"));
        }
        Ok(())
    }
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) config: LeaseConfig,
    pub(crate) leases: Arc<LeaseCache>,
    pub(crate) dirty: DirtySet,
    host: RwLock<Option<Arc<dyn PartitionHost>>>,
    persister: Mutex<Option<Persister>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let persister = self.persister.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(persister) = persister.take() {
            persister.cancel();
        }
    }
}

/// Leaser and checkpointer for one process.
///
/// Cloning is cheap and every clone drives the same cache, dirty set and
/// persister. Call [`LeaseManager::close`] before the process exits.
#[derive(Clone)]
pub struct LeaseManager {
    pub(crate) inner: Arc<Inner>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: LeaseConfig) -> Result<Self> {
        Self::with_cache(store, Arc::new(LeaseCache::new()), config)
    }

    pub fn with_cache(
        store: Arc<dyn ObjectStore>,
        leases: Arc<LeaseCache>,
        config: LeaseConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                leases,
                dirty: DirtySet::new(),
                host: RwLock::new(None),
                persister: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<LeaseCache> {
        &self.inner.leases
    }

    /// Sets the host and starts the background persister.
    ///
    /// Must run inside a Tokio runtime. Attaching again replaces the host
    /// and restarts the persister.
    pub fn attach(&self, host: Arc<dyn PartitionHost>) -> Result<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::NoRuntime);
        }
        info!(
            "attaching host {} to lease container {}",
            host.name(),
            self.inner.config.container
        );
        *self.inner.host.write().unwrap_or_else(PoisonError::into_inner) = Some(host);

        let persister = Persister::spawn(Arc::downgrade(&self.inner), &self.inner.config);
        let previous = self
            .inner
            .persister
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(persister);
        if let Some(previous) = previous {
            previous.cancel();
        }
        Ok(())
    }

    /// Stops the background persister. Dirty checkpoints that were not
    /// flushed yet stay in memory only.
    pub async fn close(&self) {
        let persister = self
            .inner
            .persister
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(persister) = persister {
            persister.stop().await;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.host().is_some()
    }

    fn host(&self) -> Option<Arc<dyn PartitionHost>> {
        self.inner
            .host
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn host_name(&self) -> Result<String> {
        self.host().map(|host| host.name()).ok_or(Error::NotAttached)
    }

    fn key(&self, partition_id: &str) -> ObjectKey {
        ObjectKey::new(self.inner.config.container.clone(), partition_id)
    }

    fn container_key(&self) -> ObjectKey {
        ObjectKey::new(self.inner.config.container.clone(), "")
    }

    fn store_timeout(&self) -> Duration {
        self.inner.config.store_timeout
    }

    pub async fn store_exists(&self) -> Result<bool> {
        let container = &self.inner.config.container;
        let key = self.container_key();
        store_call(
            "store.container_exists",
            &key,
            self.store_timeout(),
            self.inner.store.container_exists(container),
        )
        .await
    }

    /// Creates the lease container if it is missing.
    pub async fn ensure_store(&self) -> Result<()> {
        let _leases = self.inner.leases.lock().await;
        if self.store_exists().await? {
            return Ok(());
        }
        let container = &self.inner.config.container;
        let key = self.container_key();
        store_call(
            "store.create_container",
            &key,
            self.store_timeout(),
            self.inner.store.create_container(container),
        )
        .await
    }

    /// Deletes the lease container and forgets every cached lease.
    pub async fn delete_store(&self) -> Result<()> {
        let mut leases = self.inner.leases.lock().await;
        let container = &self.inner.config.container;
        let key = self.container_key();
        store_call(
            "store.delete_container",
            &key,
            self.store_timeout(),
            self.inner.store.delete_container(container),
        )
        .await?;
        leases.clear();
        self.inner.dirty.lock().await.clear();
        Ok(())
    }

    /// Makes sure a lease object exists for the partition; no ownership change.
    pub async fn ensure(&self, partition_id: &str) -> Result<Lease> {
        let _leases = self.inner.leases.lock().await;
        let key = self.key(partition_id);
        let lease = Lease::new(partition_id);
        let body = codec::encode(&lease)?;
        let created = store_call(
            "store.create_if_absent",
            &key,
            self.store_timeout(),
            self.inner.store.create_if_absent(&key, body),
        )
        .await;
        match created {
            Ok(()) => Ok(lease),
            Err(err) if matches!(err.store_error(), Some(StoreError::AlreadyExists(_))) => {
                self.read_lease(partition_id).await
            }
            Err(err) => Err(err),
        }
    }

    /// Reads every partition's lease concurrently.
    ///
    /// All or nothing: the first failed read fails the batch. On cancellation
    /// the reads still in flight are left to finish on their own and their
    /// results are dropped. The cache is never touched.
    pub async fn get_all<I>(&self, partition_ids: I, cancel: &CancellationToken) -> Result<Vec<Lease>>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let ids: Vec<String> = partition_ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let total = ids.len();
        let (tx, mut rx) = mpsc::channel(total);
        for (idx, partition_id) in ids.iter().cloned().enumerate() {
            let manager = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = manager.read_lease(&partition_id).await;
                let _ = tx.send((idx, result)).await;
            });
        }
        drop(tx);

        let mut found: Vec<Option<Lease>> = vec![None; total];
        for _ in 0..total {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                received = rx.recv() => received,
            };
            match received {
                Some((idx, Ok(lease))) => found[idx] = Some(lease),
                Some((_, Err(err))) => return Err(err),
                None => break,
            }
        }

        found
            .into_iter()
            .zip(ids)
            .map(|(lease, partition_id)| {
                lease.ok_or_else(|| Error::Store {
                    partition: partition_id,
                    source: StoreError::Backend("lease read task ended without a result".into()),
                })
            })
            .collect()
    }

    /// [`LeaseManager::get_all`] over the attached host's partitions.
    pub async fn get_leases(&self, cancel: &CancellationToken) -> Result<Vec<Lease>> {
        let host = self.host().ok_or(Error::NotAttached)?;
        self.get_all(host.partition_ids(), cancel).await
    }

    /// Takes the partition, stealing the lock if another holder has it.
    ///
    /// Contention is returned as an error and never retried here.
    pub async fn acquire(&self, partition_id: &str) -> Result<Lease> {
        let owner = self.host_name()?;
        let mut leases = self.inner.leases.lock().await;
        let key = self.key(partition_id);
        let mut lease = self.read_lease(partition_id).await?;

        let new_token = Uuid::new_v4().to_string();
        if lease.state == LeaseState::Locked {
            store_call(
                "store.break_lock",
                &key,
                self.store_timeout(),
                self.inner.store.break_lock(&key, &lease.token, &new_token),
            )
            .await?;
        } else {
            store_call(
                "store.acquire_lock",
                &key,
                self.store_timeout(),
                self.inner
                    .store
                    .acquire_lock(&key, &new_token, self.inner.config.lease_duration),
            )
            .await?;
        }

        let previous_owner = std::mem::replace(&mut lease.owner, owner);
        lease.token = new_token;
        lease.state = LeaseState::Locked;
        lease.increment_epoch();
        if let Err(err) = self.upload(&lease).await {
            // the new token was never published, so nobody else could free the lock
            let released = store_call(
                "store.release_lock",
                &key,
                self.store_timeout(),
                self.inner.store.release_lock(&key, &lease.token),
            )
            .await;
            match released {
                Ok(()) => warn!("acquire of partition {partition_id} failed, lock released: {err}"),
                Err(release_err) => error!(
                    "acquire of partition {partition_id} failed and its lock stays held \
                     until it expires: {release_err}"
                ),
            }
            return Err(err);
        }

        if !previous_owner.is_empty() && previous_owner != lease.owner {
            info!("took lease from {previous_owner}: {lease}");
        } else {
            info!("acquired lease: {lease}");
        }
        leases.insert(partition_id.to_string(), lease.clone());
        Ok(lease)
    }

    /// Extends the lock on a lease acquired earlier.
    ///
    /// `Ok(None)` means ownership was lost (expired, stolen or stale token);
    /// the cache is left as it was.
    pub async fn renew(&self, partition_id: &str) -> Result<Option<Lease>> {
        let leases = self.inner.leases.lock().await;
        let lease = leases
            .get(partition_id)
            .ok_or_else(|| Error::LeaseNotFound(partition_id.to_string()))?;
        let key = self.key(partition_id);
        let renewed = store_call(
            "store.renew_lock",
            &key,
            self.store_timeout(),
            self.inner.store.renew_lock(&key, &lease.token),
        )
        .await;
        match renewed {
            Ok(()) => Ok(Some(lease.clone())),
            Err(err) if err.is_contention() => {
                warn!("lost lease for partition {partition_id}: {err}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Releases the lock and forgets the partition, dropping any checkpoint
    /// update that was not flushed yet.
    ///
    /// When the store reports the lock already belongs to someone else the
    /// partition is still forgotten and the contention error is returned.
    pub async fn release(&self, partition_id: &str) -> Result<()> {
        let mut leases = self.inner.leases.lock().await;
        let lease = leases
            .get(partition_id)
            .ok_or_else(|| Error::LeaseNotFound(partition_id.to_string()))?;
        let key = self.key(partition_id);
        let released = store_call(
            "store.release_lock",
            &key,
            self.store_timeout(),
            self.inner.store.release_lock(&key, &lease.token),
        )
        .await;
        match released {
            Ok(()) => info!("released lease for partition {partition_id}"),
            Err(ref err) if err.is_contention() => {
                warn!("lease for partition {partition_id} was already lost: {err}")
            }
            Err(err) => return Err(err),
        }
        leases.remove(partition_id);
        self.inner.dirty.remove(partition_id).await;
        released
    }

    /// Drops the partition from the cache and the dirty set without touching
    /// the store. Returns whether it was cached.
    pub async fn forget(&self, partition_id: &str) -> bool {
        let mut leases = self.inner.leases.lock().await;
        let known = leases.remove(partition_id).is_some();
        self.inner.dirty.remove(partition_id).await;
        known
    }

    /// Renews the lock and writes the cached lease, checkpoint included.
    pub async fn update(&self, partition_id: &str) -> Result<Lease> {
        let leases = self.inner.leases.lock().await;
        let lease = leases
            .get(partition_id)
            .ok_or_else(|| Error::LeaseNotFound(partition_id.to_string()))?;
        self.update_lease(lease).await?;
        Ok(lease.clone())
    }

    /// Removes the partition's lease object, releasing our lock first.
    pub async fn delete_lease(&self, partition_id: &str) -> Result<()> {
        let mut leases = self.inner.leases.lock().await;
        let key = self.key(partition_id);
        if let Some(lease) = leases.get(partition_id) {
            let released = store_call(
                "store.release_lock",
                &key,
                self.store_timeout(),
                self.inner.store.release_lock(&key, &lease.token),
            )
            .await;
            match released {
                Ok(()) => {}
                Err(err) if err.is_contention() => {}
                Err(err) => return Err(err),
            }
        }
        store_call(
            "store.delete",
            &key,
            self.store_timeout(),
            self.inner.store.delete(&key),
        )
        .await?;
        leases.remove(partition_id);
        self.inner.dirty.remove(partition_id).await;
        Ok(())
    }

    /// Whether the partition's lock has lapsed according to the store.
    pub async fn is_expired(&self, partition_id: &str) -> Result<bool> {
        let lease = self.read_lease(partition_id).await?;
        Ok(lease.state != LeaseState::Locked)
    }

    /// Leases this process currently believes it owns.
    pub async fn owned_leases(&self) -> Vec<Lease> {
        self.inner.leases.snapshot().await
    }

    pub async fn owned_partitions(&self) -> Vec<String> {
        self.inner.leases.partition_ids().await
    }

    /// Partitions with checkpoint changes not yet written to the store.
    pub async fn dirty_partitions(&self) -> Vec<String> {
        self.inner.dirty.partition_ids().await
    }

    pub(crate) async fn read_lease(&self, partition_id: &str) -> Result<Lease> {
        let key = self.key(partition_id);
        let stored = store_call(
            "store.get",
            &key,
            self.store_timeout(),
            self.inner.store.get(&key),
        )
        .await?;
        codec::decode(&stored.body, stored.lock_state)
    }

    /// Renew-then-write under the lease's own token.
    pub(crate) async fn update_lease(&self, lease: &Lease) -> Result<()> {
        let key = self.key(&lease.partition_id);
        store_call(
            "store.renew_lock",
            &key,
            self.store_timeout(),
            self.inner.store.renew_lock(&key, &lease.token),
        )
        .await?;
        self.upload(lease).await
    }

    async fn upload(&self, lease: &Lease) -> Result<()> {
        let key = self.key(&lease.partition_id);
        let body = codec::encode(lease)?;
        store_call(
            "store.overwrite",
            &key,
            self.store_timeout(),
            self.inner.store.overwrite(&key, body, &lease.token),
        )
        .await
    }
}
