use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("corrupt snapshot: expected 8 bytes, got {len}")]
    CorruptSnapshot { len: usize },
}

/// Failures of the consensus facade.
///
/// Crosses the peer RPC boundary as-is, so a forwarded proposal surfaces
/// the leader's error unchanged on the follower.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusError {
    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    #[error("timed out waiting for the entry to commit")]
    Timeout,

    #[error("consensus unavailable: {0}")]
    Unavailable(String),

    #[error("invalid batch size {0}, must be at least 1")]
    InvalidBatch(i32),

    #[error("counter exhausted")]
    Exhausted,

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<SnapshotError> for ConsensusError {
    fn from(value: SnapshotError) -> Self {
        ConsensusError::CorruptSnapshot(value.to_string())
    }
}

impl From<StoreError> for ConsensusError {
    fn from(value: StoreError) -> Self {
        ConsensusError::Storage(value.to_string())
    }
}
