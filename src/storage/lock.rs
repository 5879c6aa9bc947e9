//! Time-bound exclusive lock rules shared by the bundled stores.
//!
//! Times are milliseconds on the store's own clock. A lock whose expiry has
//! passed no longer blocks other holders, but its previous holder may still
//! renew or release it until someone else takes the object.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ObjectKey, StoreError, StoreResult};
use crate::lease::LeaseState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LockRecord {
    pub token: String,
    pub expires_at_ms: u64,
    pub duration_ms: u64,
}

impl LockRecord {
    fn new(token: &str, duration: Duration, now_ms: u64) -> Self {
        let duration_ms = duration.as_millis() as u64;
        Self {
            token: token.to_string(),
            expires_at_ms: now_ms.saturating_add(duration_ms),
            duration_ms,
        }
    }

    fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }

    fn extend(&mut self, now_ms: u64) {
        self.expires_at_ms = now_ms.saturating_add(self.duration_ms);
    }
}

pub(crate) fn lock_state(slot: &Option<LockRecord>, now_ms: u64) -> LeaseState {
    match slot {
        Some(lock) if lock.is_active(now_ms) => LeaseState::Locked,
        _ => LeaseState::Unlocked,
    }
}

pub(crate) fn acquire(
    slot: &mut Option<LockRecord>,
    key: &ObjectKey,
    token: &str,
    duration: Duration,
    now_ms: u64,
) -> StoreResult<()> {
    if let Some(lock) = slot {
        if lock.is_active(now_ms) && lock.token != token {
            return Err(StoreError::LockHeld(key.clone()));
        }
    }
    *slot = Some(LockRecord::new(token, duration, now_ms));
    Ok(())
}

pub(crate) fn change(
    slot: &mut Option<LockRecord>,
    key: &ObjectKey,
    current_token: &str,
    new_token: &str,
    now_ms: u64,
) -> StoreResult<()> {
    match slot {
        Some(lock) if lock.is_active(now_ms) => {
            if lock.token != current_token {
                return Err(StoreError::LockMismatch(key.clone()));
            }
            lock.token = new_token.to_string();
            lock.extend(now_ms);
            Ok(())
        }
        _ => Err(StoreError::LockNotHeld(key.clone())),
    }
}

pub(crate) fn renew(
    slot: &mut Option<LockRecord>,
    key: &ObjectKey,
    token: &str,
    now_ms: u64,
) -> StoreResult<()> {
    match slot {
        Some(lock) if lock.token == token => {
            lock.extend(now_ms);
            Ok(())
        }
        Some(lock) if lock.is_active(now_ms) => Err(StoreError::LockMismatch(key.clone())),
        _ => Err(StoreError::LockNotHeld(key.clone())),
    }
}

pub(crate) fn release(
    slot: &mut Option<LockRecord>,
    key: &ObjectKey,
    token: &str,
    now_ms: u64,
) -> StoreResult<()> {
    match slot {
        Some(lock) if lock.token == token => {
            *slot = None;
            Ok(())
        }
        Some(lock) if lock.is_active(now_ms) => Err(StoreError::LockMismatch(key.clone())),
        _ => Err(StoreError::LockNotHeld(key.clone())),
    }
}

/// Checks that `token` holds an active lock, as required before an overwrite.
pub(crate) fn check_write(
    slot: &Option<LockRecord>,
    key: &ObjectKey,
    token: &str,
    now_ms: u64,
) -> StoreResult<()> {
    match slot {
        Some(lock) if lock.is_active(now_ms) => {
            if lock.token == token {
                Ok(())
            } else {
                Err(StoreError::LockMismatch(key.clone()))
            }
        }
        _ => Err(StoreError::LockNotHeld(key.clone())),
    }
}

pub(crate) fn check_delete(
    slot: &Option<LockRecord>,
    key: &ObjectKey,
    now_ms: u64,
) -> StoreResult<()> {
    match slot {
        Some(lock) if lock.is_active(now_ms) => Err(StoreError::LockHeld(key.clone())),
        _ => Ok(()),
    }
}
