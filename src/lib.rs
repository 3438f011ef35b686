//! skiff: Raft consensus for replicated state machines.
//!
//! A cluster of nodes maintains an identical, totally ordered log of
//! commands and feeds committed entries to a user-supplied deterministic
//! state machine. The library provides:
//! - Leader election with randomized timeouts
//! - Log replication with per-follower workers and hinted backtracking
//! - Leader leases: a leader cut off from a quorum steps down
//! - Single-server membership changes with nonvoter catch-up and promotion
//! - Leadership transfer
//!
//! Storage and transport are pluggable: implement [`Stable`]/[`LogStore`]
//! for durability and [`RaftTransport`] (or a [`pool::Dialer`]) for the
//! wire. In-memory implementations of both ship with the crate.

pub mod config;
pub mod error;
pub mod fsm;
pub mod membership;
pub mod pool;
pub mod storage;
pub mod trace;
pub mod transport;
pub mod types;

mod candidate;
mod follower;
mod leader;
mod node;
mod raft;
mod replication;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use fsm::{ApplyResult, StateMachine};
pub use membership::{ClusterConfig, Membership, Node};
pub use raft::Raft;
pub use replication::Round;
pub use storage::{LogStore, MemoryStorage, Stable, Storage};
pub use trace::{NodeInfo, Trace};
pub use transport::{InMemoryTransport, RaftTransport, RpcMessage, RpcReceiver, RpcSender};
pub use types::*;
