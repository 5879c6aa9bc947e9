//! Checkpoint tracking on top of the lease cache.
//!
//! Checkpoint updates only touch the cached lease and mark the partition
//! dirty; the persister writes dirty leases back on its own schedule.

use std::collections::HashMap;

use log::debug;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lease::Checkpoint;
use crate::manager::LeaseManager;

pub type DirtyMap = HashMap<String, Uuid>;

/// Partitions whose cached checkpoint is ahead of the store.
///
/// Each mark gets a fresh marker. A flush clears a partition only when the
/// marker it started with is still current.
#[derive(Debug, Default)]
pub struct DirtySet {
    markers: Mutex<DirtyMap>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, DirtyMap> {
        self.markers.lock().await
    }

    pub async fn mark(&self, partition_id: &str) -> Uuid {
        let marker = Uuid::new_v4();
        self.markers
            .lock()
            .await
            .insert(partition_id.to_string(), marker);
        marker
    }

    /// Clears the partition if `marker` is still its latest mark.
    pub async fn clear_if(&self, partition_id: &str, marker: Uuid) -> bool {
        let mut markers = self.markers.lock().await;
        if markers.get(partition_id) == Some(&marker) {
            markers.remove(partition_id);
            return true;
        }
        false
    }

    pub async fn remove(&self, partition_id: &str) -> bool {
        self.markers.lock().await.remove(partition_id).is_some()
    }

    pub async fn contains(&self, partition_id: &str) -> bool {
        self.markers.lock().await.contains_key(partition_id)
    }

    pub async fn partition_ids(&self) -> Vec<String> {
        let markers = self.markers.lock().await;
        let mut ids: Vec<String> = markers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.markers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.markers.lock().await.is_empty()
    }
}

impl LeaseManager {
    /// Cached checkpoint of an owned partition, start of stream otherwise.
    pub async fn get_checkpoint(&self, partition_id: &str) -> Checkpoint {
        let leases = self.inner.leases.lock().await;
        leases
            .get(partition_id)
            .and_then(|lease| lease.checkpoint.clone())
            .unwrap_or_default()
    }

    /// Like [`LeaseManager::get_checkpoint`], but stores the default in the
    /// cached lease of an owned partition that has none yet.
    pub async fn ensure_checkpoint(&self, partition_id: &str) -> Checkpoint {
        let mut leases = self.inner.leases.lock().await;
        match leases.get_mut(partition_id) {
            Some(lease) => lease
                .checkpoint
                .get_or_insert_with(Checkpoint::start_of_stream)
                .clone(),
            None => Checkpoint::start_of_stream(),
        }
    }

    /// Records progress in memory and marks the partition dirty.
    pub async fn update_checkpoint(&self, partition_id: &str, checkpoint: Checkpoint) -> Result<()> {
        let mut leases = self.inner.leases.lock().await;
        let lease = leases
            .get_mut(partition_id)
            .ok_or_else(|| Error::NotOwned(partition_id.to_string()))?;
        debug!(
            "checkpoint for partition {partition_id} -> offset {} seq {}",
            checkpoint.offset, checkpoint.sequence_number
        );
        lease.checkpoint = Some(checkpoint);
        self.inner.dirty.mark(partition_id).await;
        Ok(())
    }

    /// Resets the checkpoint to start of stream and writes it immediately.
    pub async fn delete_checkpoint(&self, partition_id: &str) -> Result<()> {
        let mut leases = self.inner.leases.lock().await;
        let lease = leases
            .get_mut(partition_id)
            .ok_or_else(|| Error::NotOwned(partition_id.to_string()))?;
        lease.checkpoint = Some(Checkpoint::start_of_stream());
        let written = self.update_lease(lease).await;
        // a flush already in flight may carry the old checkpoint; a fresh
        // marker keeps the partition dirty past it, and retries a failed write
        self.inner.dirty.mark(partition_id).await;
        written
    }
}
