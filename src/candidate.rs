//! Candidate role loop: elections.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};

use crate::membership::Node;
use crate::node::{NewEntry, NodeTask, RaftNode};
use crate::replication::backoff;
use crate::transport::{RaftTransport, RpcMessage};
use crate::types::*;

enum CandidateEvent {
    Shutdown,
    ElectionTimeout,
    Vote(Option<(NodeId, RequestVoteResponse)>),
    Rpc(Option<RpcMessage>),
    Entry(Option<NewEntry>),
    Task(Option<NodeTask>),
}

impl RaftNode {
    /// Run one election: bump the term, vote for self, solicit the rest.
    ///
    /// Returning with `state` still `Candidate` means the election timed
    /// out; the dispatcher re-enters and a fresh term begins.
    pub(crate) async fn run_candidate(&mut self) {
        let term = self.term.next();
        self.persist_candidacy(term);
        tracing::info!(id = %self.id, term = %self.term, "starting election");

        let quorum = self.membership.latest.quorum();
        let mut granted = 1; // self-vote

        let request = RequestVoteRequest {
            term: self.term,
            candidate_id: self.id.clone(),
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        };

        let peers: Vec<Node> = self
            .membership
            .latest
            .nodes
            .values()
            .filter(|n| n.id != self.id)
            .cloned()
            .collect();
        let (vote_tx, mut vote_rx) = mpsc::channel(peers.len().max(1));
        for peer in peers {
            tokio::spawn(solicit_vote(
                self.transport.clone(),
                peer,
                request.clone(),
                vote_tx.clone(),
            ));
        }
        drop(vote_tx);

        if granted >= quorum {
            // single-voter cluster
            self.become_leader();
            return;
        }

        let deadline = Instant::now() + self.config.random_election_timeout();
        let mut votes_pending = true;

        while self.state == Role::Candidate && !self.shutting_down {
            let event = tokio::select! {
                _ = self.shutdown_rx.recv() => CandidateEvent::Shutdown,
                _ = sleep_until(deadline) => CandidateEvent::ElectionTimeout,
                vote = vote_rx.recv(), if votes_pending => CandidateEvent::Vote(vote),
                msg = self.rpc_rx.recv() => CandidateEvent::Rpc(msg),
                ne = self.entry_rx.recv() => CandidateEvent::Entry(ne),
                task = self.task_rx.recv() => CandidateEvent::Task(task),
            };

            match event {
                CandidateEvent::Shutdown => self.shutting_down = true,
                CandidateEvent::ElectionTimeout => {
                    tracing::info!(id = %self.id, term = %self.term, "election timed out");
                    return; // try again with a higher term
                }
                CandidateEvent::Vote(Some((peer, response))) => {
                    if response.term > self.term {
                        self.step_down(response.term);
                        return;
                    }
                    if response.vote_granted && self.membership.latest.is_voter(&peer) {
                        granted += 1;
                        tracing::debug!(id = %self.id, term = %self.term, from = %peer, granted, quorum, "vote received");
                        if granted >= quorum {
                            self.become_leader();
                            return;
                        }
                    }
                }
                CandidateEvent::Vote(None) => {
                    // every solicitation finished without a quorum; wait
                    // out the timer, peers may still convert via RPC
                    votes_pending = false;
                }
                CandidateEvent::Rpc(Some(msg)) => self.reply_rpc(msg).await,
                CandidateEvent::Entry(Some(ne)) => ne.reply(Err(self.not_leader_error())),
                CandidateEvent::Task(Some(task)) => {
                    if let Some(task) = self.handle_common_task(task) {
                        self.reject_leader_task(task);
                    }
                }
                CandidateEvent::Rpc(None)
                | CandidateEvent::Entry(None)
                | CandidateEvent::Task(None) => self.shutting_down = true,
            }
        }
    }

    /// Persist `term, voted_for = self` atomically, then adopt them.
    fn persist_candidacy(&mut self, term: Term) {
        if let Err(err) = self.storage.set_vote(term, Some(self.id.clone())) {
            panic!("raft: persisting candidacy failed: {err}");
        }
        self.term = term;
        self.voted_for = Some(self.id.clone());
    }

    fn become_leader(&mut self) {
        tracing::info!(id = %self.id, term = %self.term, "won election");
        self.set_state(Role::Leader);
        self.leader_id = Some(self.id.clone());
    }
}

/// Ask one peer for its vote, retrying with backoff until an answer
/// arrives or the election is over (receiver dropped).
async fn solicit_vote(
    transport: Arc<dyn RaftTransport>,
    peer: Node,
    request: RequestVoteRequest,
    vote_tx: mpsc::Sender<(NodeId, RequestVoteResponse)>,
) {
    let mut failures: u64 = 0;
    loop {
        match transport.request_vote(&peer, request.clone()).await {
            Ok(response) => {
                let _ = vote_tx.send((peer.id.clone(), response)).await;
                return;
            }
            Err(err) => {
                failures += 1;
                tracing::debug!(peer = %peer.id, error = %err, "vote request failed");
                if vote_tx.is_closed() {
                    return;
                }
                sleep(backoff(failures)).await;
            }
        }
    }
}
