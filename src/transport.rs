//! Transport abstraction for Raft RPCs.
//!
//! The [`RaftTransport`] trait allows pluggable implementations: the
//! pooled transport in [`crate::pool`] for real networks, and
//! [`InMemoryTransport`] for in-process clusters in tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::membership::Node;
use crate::types::*;

/// Transport for outgoing Raft RPCs.
///
/// Implementations handle connection management and serialization; the
/// caller handles retries and backoff. Targets carry their own address, so
/// a transport needs no separate resolver.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    /// Send RequestVote to a peer and wait for its response.
    async fn request_vote(
        &self,
        target: &Node,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send AppendEntries (replication or heartbeat) to a peer.
    async fn append_entries(
        &self,
        target: &Node,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Ask a peer to start an immediate election (leadership transfer).
    async fn timeout_now(
        &self,
        target: &Node,
        request: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse>;
}

/// Incoming RPC envelope: the request plus a oneshot responder.
///
/// A server implementation decodes requests off the wire, sends them to the
/// node through the sender returned by [`crate::Raft::rpc_sender`], and
/// writes the response it receives back on the wire.
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        response_tx: tokio::sync::oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: tokio::sync::oneshot::Sender<AppendEntriesResponse>,
    },
    TimeoutNow {
        request: TimeoutNowRequest,
        response_tx: tokio::sync::oneshot::Sender<TimeoutNowResponse>,
    },
}

pub type RpcSender = tokio::sync::mpsc::Sender<RpcMessage>;
pub type RpcReceiver = tokio::sync::mpsc::Receiver<RpcMessage>;

/// In-memory transport: local channels, no network.
///
/// Peers are registered by id; removing a peer simulates a partition and
/// re-adding it heals the link. Useful for deterministic unit tests and
/// multi-node clusters in a single process.
pub struct InMemoryTransport {
    local_id: NodeId,
    peers: Arc<RwLock<HashMap<NodeId, RpcSender>>>,
}

impl InMemoryTransport {
    pub fn new(local_id: NodeId, peers: HashMap<NodeId, RpcSender>) -> Self {
        Self {
            local_id,
            peers: Arc::new(RwLock::new(peers)),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn add_peer(&self, peer_id: NodeId, sender: RpcSender) {
        self.peers.write().insert(peer_id, sender);
    }

    pub fn remove_peer(&self, peer_id: &NodeId) {
        self.peers.write().remove(peer_id);
    }

    fn get_peer(&self, peer_id: &NodeId) -> Result<RpcSender> {
        self.peers.read().get(peer_id).cloned().ok_or_else(|| {
            RaftError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("peer not reachable: {peer_id}"),
                ),
            }
        })
    }

    async fn round_trip<Resp>(
        &self,
        target: &Node,
        make: impl FnOnce(tokio::sync::oneshot::Sender<Resp>) -> RpcMessage,
    ) -> Result<Resp> {
        let peer = self.get_peer(&target.id)?;
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        peer.send(make(response_tx)).await.map_err(broken_pipe)?;
        response_rx.await.map_err(broken_pipe)
    }
}

fn broken_pipe(err: impl std::fmt::Display) -> RaftError {
    RaftError::Io {
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, err.to_string()),
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &Node,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.round_trip(target, |response_tx| RpcMessage::RequestVote {
            request,
            response_tx,
        })
        .await
    }

    async fn append_entries(
        &self,
        target: &Node,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.round_trip(target, |response_tx| RpcMessage::AppendEntries {
            request,
            response_tx,
        })
        .await
    }

    async fn timeout_now(
        &self,
        target: &Node,
        request: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse> {
        self.round_trip(target, |response_tx| RpcMessage::TimeoutNow {
            request,
            response_tx,
        })
        .await
    }
}
