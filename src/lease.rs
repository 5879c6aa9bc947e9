use std::fmt;

use serde::{Deserialize, Serialize};

pub const START_OF_STREAM_OFFSET: &str = "-1";
pub const END_OF_STREAM_OFFSET: &str = "@latest";

/// Lock state of a lease object as last observed in the store.
///
/// Informational only; the store holds the authoritative state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LeaseState {
    #[default]
    Unlocked,
    Locked,
}

/// Consumption progress within one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub offset: String,
    pub sequence_number: i64,
    #[serde(default)]
    pub enqueued_at_ms: u64,
}

impl Checkpoint {
    pub fn new(offset: impl Into<String>, sequence_number: i64, enqueued_at_ms: u64) -> Self {
        Self {
            offset: offset.into(),
            sequence_number,
            enqueued_at_ms,
        }
    }

    pub fn start_of_stream() -> Self {
        Self::new(START_OF_STREAM_OFFSET, 0, 0)
    }

    pub fn end_of_stream() -> Self {
        Self::new(END_OF_STREAM_OFFSET, 0, 0)
    }

    pub fn is_start_of_stream(&self) -> bool {
        self.offset == START_OF_STREAM_OFFSET
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::start_of_stream()
    }
}

/// Ownership record for one partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Lease {
    pub partition_id: String,
    /// Empty when unowned.
    pub owner: String,
    /// Mirrors the store lock token at the time the lease was uploaded.
    pub token: String,
    pub epoch: u64,
    pub state: LeaseState,
    pub checkpoint: Option<Checkpoint>,
}

impl Lease {
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            ..Self::default()
        }
    }

    pub fn increment_epoch(&mut self) -> u64 {
        self.epoch = self.epoch.saturating_add(1);
        self.epoch
    }

    pub fn is_owned(&self) -> bool {
        !self.owner.is_empty()
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.is_owned() && self.owner == owner
    }

    /// Checkpoint to resume from; start of stream when none was recorded.
    pub fn checkpoint_or_default(&self) -> Checkpoint {
        self.checkpoint.clone().unwrap_or_default()
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = if self.owner.is_empty() {
            "-"
        } else {
            self.owner.as_str()
        };
        write!(
            f,
            "partition={} owner={} epoch={} state={:?}",
            self.partition_id, owner, self.epoch, self.state
        )?;
        match &self.checkpoint {
            Some(cp) => write!(f, " offset={} seq={}", cp.offset, cp.sequence_number),
            None => write!(f, " offset=none"),
        }
    }
}
