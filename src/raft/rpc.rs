use futures::future::{self, BoxFuture, Ready};
use tarpc::context;
use tracing::debug;

use super::error::ConsensusError;
use super::raft::Raft;
use crate::storage::command::IncrementCommand;

/// Replica-to-replica service.
#[tarpc::service]
pub trait Replica {
    /// Liveness probe, answers with the callee's node name.
    async fn ping(from: String) -> String;
    /// Commits an increment on the callee. Never forwarded further.
    async fn propose(num: i32) -> Result<i64, ConsensusError>;
    /// Returns whether the snapshot was newer than local state and installed.
    async fn install_snapshot(index: u64, data: Vec<u8>) -> Result<bool, ConsensusError>;
}

#[derive(Clone)]
pub struct ReplicaServer {
    pub raft: Raft,
}

impl Replica for ReplicaServer {
    type PingFut = Ready<String>;

    fn ping(self, _: context::Context, from: String) -> Self::PingFut {
        debug!(from = %from, "ping");
        future::ready(self.raft.name().to_string())
    }

    type ProposeFut = BoxFuture<'static, Result<i64, ConsensusError>>;

    fn propose(self, _: context::Context, num: i32) -> Self::ProposeFut {
        Box::pin(async move { self.raft.propose_local(IncrementCommand::new(num)).await })
    }

    type InstallSnapshotFut = BoxFuture<'static, Result<bool, ConsensusError>>;

    fn install_snapshot(
        self,
        _: context::Context,
        index: u64,
        data: Vec<u8>,
    ) -> Self::InstallSnapshotFut {
        Box::pin(async move { self.raft.install_snapshot(index, data).await })
    }
}
