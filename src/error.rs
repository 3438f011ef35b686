//! Error types.

use thiserror::Error;

use crate::membership::Node;

/// Errors surfaced to callers of the library.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader; `leader` is a redirect hint when one is known.
    #[error("node is not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<Node> },

    /// The node has been shut down.
    #[error("raft server closed")]
    ServerClosed,

    /// A quorum of voters is unreachable.
    #[error("quorum of voters unreachable")]
    QuorumUnreachable,

    /// A membership change is already in flight.
    #[error("config change already in progress")]
    ConfigChangeInProgress,

    /// The submitted change was computed against a stale configuration.
    #[error("config changed meanwhile")]
    ConfigChanged,

    /// The leader has not yet committed an entry from its own term.
    #[error("leader has not committed an entry from its term yet")]
    NotCommitReady,

    /// Bootstrap was requested on a node that already has a configuration.
    #[error("cluster already bootstrapped")]
    AlreadyBootstrapped,

    /// The request conflicts with an operation in progress.
    #[error("{0} in progress")]
    InProgress(&'static str),

    /// The operation did not complete in time.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Invalid cluster configuration.
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// Durable storage failed; while leader this is fatal to the role.
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// I/O error from storage or transport.
    #[error("i/o error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Entry or config serialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// Internal error (bug).
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

pub type Result<T> = std::result::Result<T, RaftError>;
