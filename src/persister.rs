//! Background flushing of dirty leases.

use std::sync::Weak;
use std::time::Duration;

use log::{debug, error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::manager::{Inner, LeaseConfig, LeaseManager};

/// Handle to the persister task of one manager.
pub(crate) struct Persister {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Persister {
    pub(crate) fn spawn(manager: Weak<Inner>, config: &LeaseConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            manager,
            cancel.clone(),
            config.persist_initial_delay,
            config.persist_interval,
        ));
        Self { cancel, task }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!("lease persister task failed: {err}");
        }
    }
}

async fn run(
    weak: Weak<Inner>,
    cancel: CancellationToken,
    initial_delay: Duration,
    period: Duration,
) {
    // spread the first flush of many processes starting together
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(initial_delay) => {}
    }

    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let manager = LeaseManager { inner };
        match manager.persist_dirty(&cancel).await {
            Ok(0) => {}
            Ok(flushed) => debug!("persisted {flushed} dirty leases"),
            Err(Error::Cancelled) => break,
            Err(err) => error!("lease persist cycle failed: {err}"),
        }
    }
    debug!("lease persister stopped");
}

impl LeaseManager {
    /// Runs one persist cycle: writes every dirty lease concurrently.
    ///
    /// Flushed partitions leave the dirty set unless they were marked again
    /// meanwhile; failed ones stay for the next cycle. Returns the number
    /// flushed, or the last failure of the cycle. On cancellation the
    /// flushes in flight are abandoned.
    pub async fn persist_dirty(&self, cancel: &CancellationToken) -> Result<usize> {
        let batch = self.dirty_batch().await;
        if batch.is_empty() {
            return Ok(0);
        }

        let total = batch.len();
        let (tx, mut rx) = mpsc::channel(total);
        for (lease, marker) in batch {
            let manager = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = manager.flush(&lease).await;
                let _ = tx.send((lease.partition_id, marker, result)).await;
            });
        }
        drop(tx);

        let mut flushed = 0;
        let mut last_err = None;
        for _ in 0..total {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                received = rx.recv() => received,
            };
            let Some((partition_id, marker, result)) = received else {
                break;
            };
            match result {
                Ok(()) => {
                    self.inner.dirty.clear_if(&partition_id, marker).await;
                    flushed += 1;
                }
                Err(err) => {
                    error!(
                        "unable to persist dirty lease for partition {partition_id}, \
                         progress since the last flush may be reprocessed: {err}"
                    );
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(flushed),
        }
    }

    /// Snapshot of dirty leases with their markers. Dirty entries for
    /// partitions no longer cached are dropped.
    async fn dirty_batch(&self) -> Vec<(Lease, Uuid)> {
        let leases = self.inner.leases.lock().await;
        let mut dirty = self.inner.dirty.lock().await;
        let mut batch = Vec::with_capacity(dirty.len());
        dirty.retain(|partition_id, marker| match leases.get(partition_id) {
            Some(lease) => {
                batch.push((lease.clone(), *marker));
                true
            }
            None => false,
        });
        batch
    }

    async fn flush(&self, lease: &Lease) -> Result<()> {
        let deadline = self.inner.config.flush_timeout;
        match tokio::time::timeout(deadline, self.update_lease(lease)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }
}
