//! Optional observability callbacks.

use std::time::Instant;

use crate::error::RaftError;
use crate::membership::Membership;
use crate::replication::Round;
use crate::types::{LogIndex, NodeId, Role, Term};

/// Snapshot of a node's state, handed to trace callbacks and returned by
/// [`crate::Raft::info`].
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub term: Term,
    pub role: Role,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub membership: Membership,
}

type InfoFn = Box<dyn Fn(&NodeInfo) + Send + Sync>;

/// Hooks fired by the node at notable moments. All fields are optional;
/// callbacks run on the node task and must be quick.
#[derive(Default)]
pub struct Trace {
    pub starting: Option<InfoFn>,
    pub shutting_down: Option<InfoFn>,
    /// Fired after every role change, with the new role in the info.
    pub state_changed: Option<InfoFn>,
    pub config_changed: Option<InfoFn>,
    pub config_committed: Option<InfoFn>,
    pub config_reverted: Option<InfoFn>,
    /// A peer became unreachable (`since` set) or reachable again (`None`).
    pub unreachable: Option<Box<dyn Fn(&NodeInfo, &NodeId, Option<Instant>, Option<&str>) + Send + Sync>>,
    pub quorum_unreachable: Option<InfoFn>,
    /// A nonvoter is being promoted after the given catch-up round.
    pub promoting: Option<Box<dyn Fn(&NodeInfo, &NodeId, u64) + Send + Sync>>,
    pub round_completed: Option<Box<dyn Fn(&NodeInfo, &NodeId, &Round) + Send + Sync>>,
    pub error: Option<Box<dyn Fn(&RaftError) + Send + Sync>>,
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace").finish_non_exhaustive()
    }
}
