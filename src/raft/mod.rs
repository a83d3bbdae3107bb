pub mod conn;
pub mod error;
#[allow(clippy::module_inception)]
pub mod raft;
pub mod rpc;
pub mod sm;
pub mod state;
pub mod util;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::storage::command::{IncrementCommand, JoinCommand};

pub use error::{ConsensusError, SnapshotError};
pub use raft::Raft;
pub use sm::CounterStateMachine;
pub use state::{NodeState, Peer, Role};

/// Node summary served by `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub role: String,
    pub leader: Option<String>,
    pub high_water_mark: i64,
    pub commit_index: u64,
    pub members: Vec<String>,
}

/// What the request router needs from the consensus layer.
pub trait Consensus: Send + Sync {
    /// Resolves once the increment is committed and applied, with the
    /// high-water mark after it.
    fn propose(
        &self,
        command: IncrementCommand,
    ) -> impl Future<Output = Result<i64, ConsensusError>> + Send;

    /// Adds a replica to the membership and returns the leader's identity.
    fn add_member(
        &self,
        command: JoinCommand,
    ) -> impl Future<Output = Result<Peer, ConsensusError>> + Send;

    fn status(&self) -> NodeStatus;
}

impl Consensus for Raft {
    fn propose(
        &self,
        command: IncrementCommand,
    ) -> impl Future<Output = Result<i64, ConsensusError>> + Send {
        Raft::propose(self, command)
    }

    fn add_member(
        &self,
        command: JoinCommand,
    ) -> impl Future<Output = Result<Peer, ConsensusError>> + Send {
        Raft::add_member(self, command)
    }

    fn status(&self) -> NodeStatus {
        Raft::status(self)
    }
}
