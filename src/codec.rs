//! Lease record codec.
//!
//! A lease is stored as one JSON object per partition. The lock state is not
//! part of the body; it comes from the store alongside the bytes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lease::{Checkpoint, Lease, LeaseState};

pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRecord {
    #[serde(default = "legacy_version")]
    version: u32,
    #[serde(rename = "partitionID")]
    partition_id: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    epoch: u64,
    #[serde(default)]
    checkpoint: Option<Checkpoint>,
}

// Bodies written before the version field existed.
fn legacy_version() -> u32 {
    1
}

pub fn encode(lease: &Lease) -> Result<Vec<u8>> {
    let record = LeaseRecord {
        version: RECORD_VERSION,
        partition_id: lease.partition_id.clone(),
        owner: lease.owner.clone(),
        token: lease.token.clone(),
        epoch: lease.epoch,
        checkpoint: lease.checkpoint.clone(),
    };
    Ok(serde_json::to_vec(&record)?)
}

pub fn decode(bytes: &[u8], state: LeaseState) -> Result<Lease> {
    let record: LeaseRecord = serde_json::from_slice(bytes)?;
    if record.version > RECORD_VERSION {
        return Err(Error::UnsupportedVersion(record.version));
    }
    Ok(Lease {
        partition_id: record.partition_id,
        owner: record.owner,
        token: record.token,
        epoch: record.epoch,
        state,
        checkpoint: record.checkpoint,
    })
}
