//! Hook wrapped around every store interaction.

use std::future::Future;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::storage::{ObjectKey, StoreError, StoreResult};

pub(crate) async fn store_call<T, F>(
    op: &'static str,
    key: &ObjectKey,
    deadline: Duration,
    call: F,
) -> Result<T>
where
    F: Future<Output = StoreResult<T>>,
{
    let started = Instant::now();
    debug!("{op} {key}: start");
    let outcome = tokio::time::timeout(deadline, call).await;
    let elapsed = started.elapsed();
    match outcome {
        Ok(Ok(value)) => {
            debug!("{op} {key}: ok in {elapsed:?}");
            Ok(value)
        }
        Ok(Err(err)) => {
            match &err {
                StoreError::AlreadyExists(_) | StoreError::NotFound(_) => {
                    debug!("{op} {key}: {err} after {elapsed:?}")
                }
                err if err.is_contention() => warn!("{op} {key}: {err} after {elapsed:?}"),
                err => error!("{op} {key}: {err} after {elapsed:?}"),
            }
            Err(Error::from_store(&key.name, err))
        }
        Err(_) => {
            error!("{op} {key}: no response within {deadline:?}");
            Err(Error::Timeout(deadline))
        }
    }
}
