//! Leases this process believes it owns.

use std::collections::HashMap;

use tokio::sync::{Mutex, MutexGuard};

use crate::lease::Lease;

pub type LeaseMap = HashMap<String, Lease>;

/// Partition id -> last known lease, behind one lock.
///
/// The manager holds the guard across the store round-trip of acquire,
/// renew, release and update, so those operations are serialised against
/// each other for every partition.
#[derive(Debug, Default)]
pub struct LeaseCache {
    leases: Mutex<LeaseMap>,
}

impl LeaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, LeaseMap> {
        self.leases.lock().await
    }

    pub async fn get(&self, partition_id: &str) -> Option<Lease> {
        self.leases.lock().await.get(partition_id).cloned()
    }

    pub async fn contains(&self, partition_id: &str) -> bool {
        self.leases.lock().await.contains_key(partition_id)
    }

    /// Cached leases sorted by partition id.
    pub async fn snapshot(&self) -> Vec<Lease> {
        let leases = self.leases.lock().await;
        let mut out: Vec<Lease> = leases.values().cloned().collect();
        out.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        out
    }

    pub async fn partition_ids(&self) -> Vec<String> {
        let leases = self.leases.lock().await;
        let mut ids: Vec<String> = leases.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.leases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leases.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_mutations_are_visible() {
        let cache = LeaseCache::new();
        assert!(cache.is_empty().await);
        {
            let mut leases = cache.lock().await;
            leases.insert("1".into(), Lease::new("1"));
            leases.insert("0".into(), Lease::new("0"));
        }
        assert_eq!(cache.len().await, 2);
        assert!(cache.contains("0").await);
        assert_eq!(cache.partition_ids().await, vec!["0", "1"]);
        let ids: Vec<String> = cache
            .snapshot()
            .await
            .into_iter()
            .map(|lease| lease.partition_id)
            .collect();
        assert_eq!(ids, vec!["0", "1"]);

        cache.lock().await.remove("0");
        assert!(cache.get("0").await.is_none());
        assert_eq!(cache.get("1").await.map(|l| l.partition_id), Some("1".into()));
    }
}
