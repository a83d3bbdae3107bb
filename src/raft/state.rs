// A node is either the leader, which owns the log, or a follower
// that forwards proposals to the leader it joined.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity of a replica as other replicas reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    /// Peer RPC address.
    #[serde(rename = "connectionString")]
    pub connection_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower { leader: Option<Peer> },
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower { .. } => "follower",
        }
    }
}

/// Persisted to the `state` file whenever membership, role or the
/// snapshot index change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub name: String,
    pub role: Role,
    pub members: BTreeMap<String, String>,

    // monotonically increases
    pub commit_index: u64,
    // last index covered by the snapshot file
    pub snapshot_index: u64,
}

impl NodeState {
    pub fn init_state(name: impl Into<String>, role: Role) -> NodeState {
        NodeState {
            name: name.into(),
            role,
            members: BTreeMap::new(),
            commit_index: 0,
            snapshot_index: 0,
        }
    }

    /// Nothing was ever committed or installed on this node.
    pub fn is_log_empty(&self) -> bool {
        self.commit_index == 0
    }

    pub fn leader_name(&self) -> Option<String> {
        match &self.role {
            Role::Leader => Some(self.name.clone()),
            Role::Follower { leader } => leader.as_ref().map(|p| p.name.clone()),
        }
    }
}
