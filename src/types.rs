//! Core types: terms, log indexes, entries, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raft term number (monotonically increasing).
///
/// Terms act as a logical clock. Each term has at most one leader; a node
/// starting an election first increments its term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is the "no entry" sentinel).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Node identifier, unique across the cluster for all time.
///
/// A string to support DNS names, UUIDs, or ip:port combinations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a log (or queued) entry carries.
///
/// `Query` and `Barrier` never enter the log: they are queued on the leader
/// and serviced once everything before them has been applied. `Config`
/// entries carry a membership change and are consumed by the node itself,
/// never by the user state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Blank entry appended by a new leader to begin its term.
    Noop,
    /// User command, applied to the state machine.
    Command,
    /// Read serviced through the state machine, not persisted.
    Query,
    /// Fence: completes only after all prior commands have applied.
    Barrier,
    /// Cluster membership change.
    Config,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryKind::Noop => "noop",
            EntryKind::Command => "command",
            EntryKind::Query => "query",
            EntryKind::Barrier => "barrier",
            EntryKind::Config => "config",
        };
        write!(f, "{s}")
    }
}

/// A log entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub index: LogIndex,
    pub term: Term,
    pub data: Bytes,
}

impl Entry {
    pub fn new(kind: EntryKind, index: LogIndex, term: Term, data: Bytes) -> Self {
        Self {
            kind,
            index,
            term,
            data,
        }
    }
}

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// RequestVote RPC request, sent by a candidate to gather votes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,

    /// Candidate requesting the vote.
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry.
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Voter's current term, for the candidate to update itself.
    pub term: Term,

    /// True if the candidate received the vote.
    pub vote_granted: bool,
}

/// AppendEntries RPC request: log replication and heartbeats.
///
/// An empty `entries` list is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,

    /// Leader's id, so followers can redirect clients.
    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat).
    pub entries: Vec<Entry>,

    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term, for the leader to update itself.
    pub term: Term,

    /// True if the consistency check at `prev_log_index` passed.
    pub success: bool,

    /// Follower's last log index. On failure this is the rewind hint:
    /// the leader takes `min(next_index - 1, last_log_index + 1)`.
    pub last_log_index: LogIndex,
}

/// TimeoutNow RPC request, sent by a leader handing off leadership.
///
/// The target skips its election timeout and campaigns immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    /// Leader's term.
    pub term: Term,

    /// Leader's id.
    pub leader_id: NodeId,
}

/// TimeoutNow RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    /// Target's current term.
    pub term: Term,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_ordering() {
        assert!(Term(2) > Term(1));
        assert_eq!(Term(5).next(), Term(6));
    }

    #[test]
    fn log_index_ordering() {
        assert!(LogIndex(10) > LogIndex(5));
        assert_eq!(LogIndex(5).next(), LogIndex(6));
        assert_eq!(LogIndex(5).prev(), Some(LogIndex(4)));
        assert_eq!(LogIndex(0).prev(), None);
    }

    #[test]
    fn display_forms() {
        assert_eq!(Term(3).to_string(), "T3");
        assert_eq!(LogIndex(7).to_string(), "I7");
        assert_eq!(NodeId::new("n1").to_string(), "n1");
        assert_eq!(Role::Leader.to_string(), "leader");
    }
}
