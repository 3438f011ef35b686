//! The node task: owner of all consensus state.
//!
//! One task per node runs [`RaftNode::run`], dispatching into the role
//! loops (`follower`, `candidate`, `leader` modules). The term, vote,
//! role, commit index, and membership are mutated only on this task;
//! other tasks talk to it through channels.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::fsm::{ApplyItem, ApplyResult};
use crate::membership::{ClusterConfig, Membership, Node};
use crate::storage::Storage;
use crate::trace::{NodeInfo, Trace};
use crate::transport::{RaftTransport, RpcMessage};
use crate::types::*;

/// A client submission, queued on the leader until commit.
pub(crate) struct NewEntry {
    pub kind: EntryKind,
    pub data: Bytes,
    pub index: LogIndex,
    pub term: Term,
    pub reply: Option<oneshot::Sender<Result<ApplyResult>>>,
}

impl NewEntry {
    pub fn new(
        kind: EntryKind,
        data: Bytes,
        reply: Option<oneshot::Sender<Result<ApplyResult>>>,
    ) -> Self {
        Self {
            kind,
            data,
            index: LogIndex::ZERO,
            term: Term::ZERO,
            reply,
        }
    }

    pub fn reply(mut self, result: Result<ApplyResult>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }
}

/// Admin operations executed on the node task.
pub(crate) enum NodeTask {
    Bootstrap {
        nodes: Vec<Node>,
        reply: oneshot::Sender<Result<()>>,
    },
    ChangeConfig {
        new: ClusterConfig,
        reply: oneshot::Sender<Result<ApplyResult>>,
    },
    TransferLeadership {
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Compact {
        up_to: LogIndex,
        reply: oneshot::Sender<Result<()>>,
    },
    Inspect {
        f: Box<dyn FnOnce(&NodeInfo) + Send>,
    },
}

/// Channel ends handed to the node task at startup.
pub(crate) struct NodeChannels {
    pub rpc_rx: mpsc::Receiver<RpcMessage>,
    pub entry_rx: mpsc::Receiver<NewEntry>,
    pub task_rx: mpsc::Receiver<NodeTask>,
    pub fsm_tx: mpsc::Sender<ApplyItem>,
    pub shutdown_rx: broadcast::Receiver<()>,
}

pub(crate) struct RaftNode {
    pub(crate) id: NodeId,
    pub(crate) config: RaftConfig,
    pub(crate) storage: Arc<Storage>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) trace: Trace,

    pub(crate) term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) state: Role,
    pub(crate) leader_id: Option<NodeId>,

    pub(crate) last_log_index: LogIndex,
    pub(crate) last_log_term: Term,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,

    pub(crate) membership: Membership,

    /// Set on a fatal storage append failure; suppresses re-election until
    /// an operator intervenes.
    pub(crate) append_err: Option<String>,

    pub(crate) rpc_rx: mpsc::Receiver<RpcMessage>,
    pub(crate) entry_rx: mpsc::Receiver<NewEntry>,
    pub(crate) task_rx: mpsc::Receiver<NodeTask>,
    pub(crate) fsm_tx: mpsc::Sender<ApplyItem>,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
    pub(crate) shutting_down: bool,

    /// Set by handlers that should push the election deadline out; role
    /// loops consume it.
    pub(crate) election_reset: bool,
}

impl RaftNode {
    /// Recover durable state and assemble the node.
    pub(crate) fn new(
        id: NodeId,
        config: RaftConfig,
        storage: Arc<Storage>,
        transport: Arc<dyn RaftTransport>,
        trace: Trace,
        channels: NodeChannels,
    ) -> Result<Self> {
        let (term, voted_for) = storage.get_vote()?;
        let (last_log_index, last_log_term) = match storage.last_entry()? {
            Some(entry) => (entry.index, entry.term),
            None => (LogIndex::ZERO, Term::ZERO),
        };
        let membership = storage.get_configs()?.unwrap_or_default();

        Ok(Self {
            id,
            config,
            storage,
            transport,
            trace,
            term,
            voted_for,
            state: Role::Follower,
            leader_id: None,
            last_log_index,
            last_log_term,
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            membership,
            append_err: None,
            rpc_rx: channels.rpc_rx,
            entry_rx: channels.entry_rx,
            task_rx: channels.task_rx,
            fsm_tx: channels.fsm_tx,
            shutdown_rx: channels.shutdown_rx,
            shutting_down: false,
            election_reset: false,
        })
    }

    pub(crate) async fn run(mut self) {
        if let Some(f) = &self.trace.starting {
            f(&self.info());
        }
        tracing::info!(id = %self.id, term = %self.term, "raft node starting");

        while !self.shutting_down {
            match self.state {
                Role::Follower => self.run_follower().await,
                Role::Candidate => self.run_candidate().await,
                Role::Leader => self.run_leader().await,
            }
        }

        if let Some(f) = &self.trace.shutting_down {
            f(&self.info());
        }
        tracing::info!(id = %self.id, "raft node shutdown");
    }

    pub(crate) fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            term: self.term,
            role: self.state,
            leader: self.leader_id.clone(),
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
            membership: self.membership.clone(),
        }
    }

    // ---- term, vote, role ----------------------------------------------

    /// Adopt a higher term, clearing the vote. Durable before the fields
    /// change; a lost vote record would allow double voting.
    pub(crate) fn set_term(&mut self, term: Term) {
        if let Err(err) = self.storage.set_vote(term, None) {
            panic!("raft: persisting term failed: {err}");
        }
        self.term = term;
        self.voted_for = None;
    }

    pub(crate) fn set_voted_for(&mut self, candidate: NodeId) {
        if let Err(err) = self.storage.set_vote(self.term, Some(candidate.clone())) {
            panic!("raft: persisting vote failed: {err}");
        }
        self.voted_for = Some(candidate);
    }

    pub(crate) fn set_state(&mut self, state: Role) {
        if self.state == state {
            return;
        }
        tracing::info!(id = %self.id, term = %self.term, from = %self.state, to = %state, "state change");
        self.state = state;
        if let Some(f) = &self.trace.state_changed {
            f(&self.info());
        }
    }

    /// Adopt `term` if newer and fall back to follower.
    pub(crate) fn step_down(&mut self, term: Term) {
        if term > self.term {
            self.set_term(term);
        }
        self.set_state(Role::Follower);
    }

    // ---- rpc handling ---------------------------------------------------

    pub(crate) async fn reply_rpc(&mut self, msg: RpcMessage) {
        match msg {
            RpcMessage::RequestVote {
                request,
                response_tx,
            } => {
                let response = self.handle_request_vote(request);
                let _ = response_tx.send(response);
            }
            RpcMessage::AppendEntries {
                request,
                response_tx,
            } => {
                let response = self.handle_append_entries(request).await;
                let _ = response_tx.send(response);
            }
            RpcMessage::TimeoutNow {
                request,
                response_tx,
            } => {
                let response = self.handle_timeout_now(request);
                let _ = response_tx.send(response);
            }
        }
    }

    pub(crate) fn handle_request_vote(&mut self, request: RequestVoteRequest) -> RequestVoteResponse {
        if request.term < self.term {
            return RequestVoteResponse {
                term: self.term,
                vote_granted: false,
            };
        }
        if request.term > self.term {
            self.step_down(request.term);
        }

        let mut vote_granted = false;
        let free_to_vote = match &self.voted_for {
            None => true,
            Some(id) => *id == request.candidate_id,
        };
        if free_to_vote {
            let log_ok = request.last_log_term > self.last_log_term
                || (request.last_log_term == self.last_log_term
                    && request.last_log_index >= self.last_log_index);
            if log_ok {
                vote_granted = true;
                self.set_voted_for(request.candidate_id.clone());
                self.election_reset = true;
                tracing::debug!(id = %self.id, term = %self.term, candidate = %request.candidate_id, "vote granted");
            }
        }

        RequestVoteResponse {
            term: self.term,
            vote_granted,
        }
    }

    pub(crate) async fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let mut response = AppendEntriesResponse {
            term: self.term,
            success: false,
            last_log_index: self.last_log_index,
        };
        if request.term < self.term {
            return response;
        }
        if request.term > self.term || self.state != Role::Follower {
            if self.state == Role::Leader && request.term == self.term {
                // two leaders in one term would break election safety
                panic!(
                    "[BUG] {}: second leader {} in term {}",
                    self.id, request.leader_id, self.term
                );
            }
            self.step_down(request.term);
            response.term = self.term;
        }

        self.leader_id = Some(request.leader_id.clone());
        self.election_reset = true;

        // consistency check at prev_log_index
        if request.prev_log_index > LogIndex::ZERO {
            if request.prev_log_index > self.last_log_index {
                return response;
            }
            let prev_term = if request.prev_log_index == self.last_log_index {
                self.last_log_term
            } else {
                match self.storage.get_entry(request.prev_log_index) {
                    Ok(entry) => entry.term,
                    Err(err) => {
                        // below our first retained index: that prefix is
                        // committed, so it matches by definition
                        if request.prev_log_index < self.storage.first_index() {
                            request.prev_log_term
                        } else {
                            tracing::error!(id = %self.id, error = %err, "log read failed");
                            return response;
                        }
                    }
                }
            };
            if prev_term != request.prev_log_term {
                return response;
            }
        }

        for entry in &request.entries {
            if entry.index.0 < self.storage.first_index().0 {
                continue; // compacted, necessarily identical
            }
            if entry.index <= self.last_log_index {
                let existing_term = if entry.index == self.last_log_index {
                    self.last_log_term
                } else {
                    match self.storage.get_entry(entry.index) {
                        Ok(e) => e.term,
                        Err(err) => panic!("[BUG] reading retained entry {}: {err}", entry.index),
                    }
                };
                if existing_term == entry.term {
                    continue; // already have it
                }
                // conflicting suffix: must be uncommitted
                assert!(
                    entry.index > self.commit_index,
                    "[BUG] {}: conflict at committed index {}",
                    self.id,
                    entry.index
                );
                if let Err(err) = self.truncate_suffix(entry.index) {
                    tracing::error!(id = %self.id, error = %err, "log truncation failed");
                    return response;
                }
            }
            if let Err(err) = self.append_from_leader(entry) {
                self.trace_error(&err);
                tracing::error!(id = %self.id, error = %err, "log append failed");
                response.last_log_index = self.last_log_index;
                return response;
            }
        }

        if request.leader_commit > self.commit_index {
            // cap at the prefix this request verified, not our whole log:
            // anything past it could be a stale tail awaiting truncation
            let verified_last =
                LogIndex(request.prev_log_index.0 + request.entries.len() as u64);
            let new_commit = request.leader_commit.min(verified_last);
            if new_commit > self.commit_index {
                self.set_commit_index(new_commit);
                self.apply_committed(None).await;
            }
        }

        response.success = true;
        response.term = self.term;
        response.last_log_index = self.last_log_index;
        response
    }

    pub(crate) fn handle_timeout_now(&mut self, request: TimeoutNowRequest) -> TimeoutNowResponse {
        if request.term > self.term {
            self.step_down(request.term);
        }
        if request.term == self.term
            && self.state == Role::Follower
            && self.membership.latest.is_voter(&self.id)
            && self.append_err.is_none()
        {
            tracing::info!(id = %self.id, from = %request.leader_id, "timeout-now, campaigning immediately");
            self.set_state(Role::Candidate);
        }
        TimeoutNowResponse { term: self.term }
    }

    // ---- log mutation ---------------------------------------------------

    fn append_from_leader(&mut self, entry: &Entry) -> Result<()> {
        debug_assert_eq!(entry.index, self.last_log_index.next());
        self.storage.append_entry(entry)?;
        self.last_log_index = entry.index;
        self.last_log_term = entry.term;
        if entry.kind == EntryKind::Config {
            let config = ClusterConfig::from_entry(entry)
                .unwrap_or_else(|err| panic!("[BUG] decoding config entry {}: {err}", entry.index));
            self.set_latest_config(config);
        }
        Ok(())
    }

    /// Delete the uncommitted suffix starting at `from`, reverting an
    /// uncommitted config that lived in it.
    pub(crate) fn truncate_suffix(&mut self, from: LogIndex) -> Result<()> {
        assert!(
            from > self.commit_index,
            "[BUG] {}: truncating committed suffix at {}",
            self.id,
            from
        );
        tracing::debug!(id = %self.id, from = %from, "truncating log suffix");
        self.storage.delete_gte(from)?;
        self.last_log_index = LogIndex(from.0 - 1);
        self.last_log_term = if self.last_log_index == LogIndex::ZERO {
            Term::ZERO
        } else {
            self.storage.get_entry(self.last_log_index)?.term
        };
        if self.membership.latest.index >= from {
            self.revert_config();
        }
        Ok(())
    }

    // ---- commit & apply -------------------------------------------------

    pub(crate) fn set_commit_index(&mut self, index: LogIndex) {
        debug_assert!(index >= self.commit_index);
        self.commit_index = index;
        tracing::debug!(id = %self.id, commit = %index, "commit index advanced");
    }

    /// Hand every newly committed entry to the apply task, in index order.
    ///
    /// The leader passes its pending-entry queue so committed submissions
    /// are answered and queued queries/barriers are released at their
    /// pseudo-index; followers read everything back from the log.
    pub(crate) async fn apply_committed(&mut self, mut queue: Option<&mut VecDeque<NewEntry>>) {
        loop {
            // release queued non-log entries that are due
            if let Some(q) = queue.as_mut() {
                while let Some(front) = q.front() {
                    let due = front.index == self.last_applied.next()
                        && matches!(front.kind, EntryKind::Query | EntryKind::Barrier);
                    if !due {
                        break;
                    }
                    let ne = q.pop_front().expect("front checked above");
                    let item = ApplyItem {
                        kind: ne.kind,
                        index: ne.index,
                        data: ne.data,
                        reply: ne.reply,
                    };
                    if !self.send_to_fsm(item).await {
                        return;
                    }
                }
            }

            if self.last_applied >= self.commit_index {
                return;
            }
            let next = self.last_applied.next();

            let queued = match queue.as_mut() {
                Some(q) if q.front().map(|f| f.index) == Some(next) => q.pop_front(),
                _ => None,
            };

            match queued {
                Some(ne) => match ne.kind {
                    EntryKind::Command => {
                        let item = ApplyItem {
                            kind: ne.kind,
                            index: ne.index,
                            data: ne.data,
                            reply: ne.reply,
                        };
                        if !self.send_to_fsm(item).await {
                            return;
                        }
                    }
                    EntryKind::Config => {
                        self.commit_config_at(next, None);
                        ne.reply(Ok(ApplyResult {
                            index: next,
                            value: None,
                        }));
                    }
                    EntryKind::Noop => {}
                    EntryKind::Query | EntryKind::Barrier => {
                        unreachable!("[BUG] non-log entry at log index {next}")
                    }
                },
                None => {
                    let entry = self.storage.get_entry(next).unwrap_or_else(|err| {
                        panic!("[BUG] reading committed entry {next}: {err}")
                    });
                    match entry.kind {
                        EntryKind::Command => {
                            let item = ApplyItem {
                                kind: entry.kind,
                                index: entry.index,
                                data: entry.data,
                                reply: None,
                            };
                            if !self.send_to_fsm(item).await {
                                return;
                            }
                        }
                        EntryKind::Config => self.commit_config_at(next, Some(&entry)),
                        EntryKind::Noop => {}
                        EntryKind::Query | EntryKind::Barrier => {
                            unreachable!("[BUG] non-log entry {} in log", entry.kind)
                        }
                    }
                }
            }
            self.last_applied = next;
        }
    }

    async fn send_to_fsm(&mut self, item: ApplyItem) -> bool {
        tokio::select! {
            result = self.fsm_tx.send(item) => result.is_ok(),
            _ = self.shutdown_rx.recv() => {
                self.shutting_down = true;
                false
            }
        }
    }

    // ---- membership -----------------------------------------------------

    /// Optimistically install a stored-but-uncommitted configuration.
    pub(crate) fn set_latest_config(&mut self, config: ClusterConfig) {
        tracing::info!(id = %self.id, config = %config, "config changed");
        self.membership.latest = config;
        self.persist_configs();
        if let Some(f) = &self.trace.config_changed {
            f(&self.info());
        }
    }

    /// A config entry at `index` just committed. Normally that entry is
    /// `latest`; after a revert or a newer in-flight change it is not, and
    /// the committed configuration is re-read from the log.
    pub(crate) fn commit_config_at(&mut self, index: LogIndex, entry: Option<&Entry>) {
        if self.membership.latest.index == index {
            if self.membership.committed.index != index {
                self.membership.committed = self.membership.latest.clone();
                self.persist_configs();
                tracing::info!(id = %self.id, config = %self.membership.committed, "config committed");
                if let Some(f) = &self.trace.config_committed {
                    f(&self.info());
                }
            }
        } else {
            let decoded = match entry {
                Some(e) => ClusterConfig::from_entry(e),
                None => self
                    .storage
                    .get_entry(index)
                    .and_then(|e| ClusterConfig::from_entry(&e)),
            };
            let config = decoded
                .unwrap_or_else(|err| panic!("[BUG] decoding committed config {index}: {err}"));
            if self.membership.latest.index < index {
                self.membership.latest = config.clone();
            }
            self.membership.committed = config;
            self.persist_configs();
            tracing::info!(id = %self.id, config = %self.membership.committed, "config committed");
            if let Some(f) = &self.trace.config_committed {
                f(&self.info());
            }
        }

        if self.state == Role::Leader && !self.membership.latest.is_voter(&self.id) {
            tracing::info!(id = %self.id, "no longer a voter, stepping down");
            self.set_state(Role::Follower);
            self.leader_id = None;
        }
    }

    pub(crate) fn revert_config(&mut self) {
        tracing::info!(id = %self.id, config = %self.membership.committed, "config reverted");
        self.membership.latest = self.membership.committed.clone();
        self.persist_configs();
        if let Some(f) = &self.trace.config_reverted {
            f(&self.info());
        }
    }

    fn persist_configs(&mut self) {
        if let Err(err) = self.storage.set_configs(&self.membership) {
            tracing::warn!(id = %self.id, error = %err, "persisting configs failed");
            self.trace_error(&err);
        }
    }

    // ---- tasks ----------------------------------------------------------

    /// Handle the role-independent tasks; leader-only tasks are returned
    /// to the caller.
    pub(crate) fn handle_common_task(&mut self, task: NodeTask) -> Option<NodeTask> {
        match task {
            NodeTask::Bootstrap { nodes, reply } => {
                let result = self.handle_bootstrap(nodes);
                let _ = reply.send(result);
                None
            }
            NodeTask::Compact { up_to, reply } => {
                let result = self.handle_compact(up_to);
                let _ = reply.send(result);
                None
            }
            NodeTask::Inspect { f } => {
                f(&self.info());
                None
            }
            leader_only => Some(leader_only),
        }
    }

    /// Reject a leader-only task on a non-leader.
    pub(crate) fn reject_leader_task(&self, task: NodeTask) {
        match task {
            NodeTask::ChangeConfig { reply, .. } => {
                let _ = reply.send(Err(self.not_leader_error()));
            }
            NodeTask::TransferLeadership { reply, .. } => {
                let _ = reply.send(Err(self.not_leader_error()));
            }
            _ => unreachable!("[BUG] only leader tasks are rejected"),
        }
    }

    fn handle_bootstrap(&mut self, nodes: Vec<Node>) -> Result<()> {
        if !self.membership.is_bootstrap() {
            return Err(RaftError::AlreadyBootstrapped);
        }
        let config = ClusterConfig::new(nodes, LogIndex(1), Term(1));
        config.validate()?;
        match config.node(&self.id) {
            Some(node) if node.voter => {}
            Some(_) => {
                return Err(RaftError::InvalidConfig {
                    reason: format!("self {} must be a voter", self.id),
                })
            }
            None => {
                return Err(RaftError::InvalidConfig {
                    reason: format!("self {} is not in the config", self.id),
                })
            }
        }

        tracing::info!(id = %self.id, config = %config, "bootstrapping");
        let entry = config.to_entry()?;
        self.storage.append_entry(&entry)?;
        self.last_log_index = entry.index;
        self.last_log_term = entry.term;
        self.set_latest_config(config);
        Ok(())
    }

    fn handle_compact(&mut self, up_to: LogIndex) -> Result<()> {
        if up_to > self.last_applied {
            return Err(RaftError::Internal {
                reason: format!(
                    "compact({up_to}) beyond applied index {}",
                    self.last_applied
                ),
            });
        }
        if up_to < self.storage.first_index() || self.storage.count() == 0 {
            return Ok(()); // already compacted
        }
        self.storage.delete_lte(up_to)
    }

    // ---- misc -----------------------------------------------------------

    pub(crate) fn not_leader_error(&self) -> RaftError {
        let leader = self
            .leader_id
            .as_ref()
            .and_then(|id| self.membership.latest.node(id))
            .cloned();
        RaftError::NotLeader { leader }
    }

    pub(crate) fn take_election_reset(&mut self) -> bool {
        std::mem::take(&mut self.election_reset)
    }

    pub(crate) fn trace_error(&self, err: &RaftError) {
        if let Some(f) = &self.trace.error {
            f(err);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::{InMemoryTransport, RpcSender};
    use std::collections::HashMap;

    pub(crate) struct TestNode {
        pub node: RaftNode,
        pub fsm_rx: mpsc::Receiver<ApplyItem>,
        pub rpc_tx: RpcSender,
        pub entry_tx: mpsc::Sender<NewEntry>,
        pub task_tx: mpsc::Sender<NodeTask>,
        pub shutdown_tx: broadcast::Sender<()>,
    }

    pub(crate) fn test_node(id: &str) -> TestNode {
        let (storage, _) = Storage::memory();
        let (rpc_tx, rpc_rx) = mpsc::channel(16);
        let (entry_tx, entry_rx) = mpsc::channel(16);
        let (task_tx, task_rx) = mpsc::channel(16);
        let (fsm_tx, fsm_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(NodeId::new(id), HashMap::new()));
        let node = RaftNode::new(
            NodeId::new(id),
            RaftConfig::default(),
            Arc::new(storage),
            transport,
            Trace::default(),
            NodeChannels {
                rpc_rx,
                entry_rx,
                task_rx,
                fsm_tx,
                shutdown_rx,
            },
        )
        .unwrap();
        TestNode {
            node,
            fsm_rx,
            rpc_tx,
            entry_tx,
            task_tx,
            shutdown_tx,
        }
    }

    fn vote_req(term: u64, candidate: &str, last_index: u64, last_term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term: Term(term),
            candidate_id: NodeId::new(candidate),
            last_log_index: LogIndex(last_index),
            last_log_term: Term(last_term),
        }
    }

    #[tokio::test]
    async fn grants_vote_and_adopts_term() {
        let mut t = test_node("n1");
        let response = t.node.handle_request_vote(vote_req(5, "n2", 0, 0));
        assert!(response.vote_granted);
        assert_eq!(response.term, Term(5));
        assert_eq!(t.node.term, Term(5));
        assert_eq!(t.node.voted_for, Some(NodeId::new("n2")));
        // durable
        assert_eq!(
            t.node.storage.get_vote().unwrap(),
            (Term(5), Some(NodeId::new("n2")))
        );
    }

    #[tokio::test]
    async fn rejects_stale_term_vote() {
        let mut t = test_node("n1");
        t.node.set_term(Term(10));
        let response = t.node.handle_request_vote(vote_req(5, "n2", 0, 0));
        assert!(!response.vote_granted);
        assert_eq!(response.term, Term(10));
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let mut t = test_node("n1");
        assert!(t.node.handle_request_vote(vote_req(5, "n2", 0, 0)).vote_granted);
        // different candidate, same term
        assert!(!t.node.handle_request_vote(vote_req(5, "n3", 0, 0)).vote_granted);
        // same candidate may retry
        assert!(t.node.handle_request_vote(vote_req(5, "n2", 0, 0)).vote_granted);
        // higher term clears the vote
        assert!(t.node.handle_request_vote(vote_req(6, "n3", 0, 0)).vote_granted);
    }

    #[tokio::test]
    async fn rejects_vote_for_stale_log() {
        let mut t = test_node("n1");
        let entry = Entry::new(EntryKind::Command, LogIndex(1), Term(2), Bytes::from("x"));
        t.node.storage.append_entry(&entry).unwrap();
        t.node.last_log_index = LogIndex(1);
        t.node.last_log_term = Term(2);

        // candidate's last term is older
        assert!(!t.node.handle_request_vote(vote_req(5, "n2", 5, 1)).vote_granted);
        // same last term, shorter log
        assert!(!t.node.handle_request_vote(vote_req(5, "n3", 0, 2)).vote_granted);
        // same last term, equal length
        assert!(t.node.handle_request_vote(vote_req(5, "n4", 1, 2)).vote_granted);
    }

    #[tokio::test]
    async fn candidate_steps_down_on_current_leader_heartbeat() {
        let mut t = test_node("n1");
        t.node.set_term(Term(3));
        t.node.set_state(Role::Candidate);

        let response = t
            .node
            .handle_append_entries(AppendEntriesRequest {
                term: Term(3),
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: Vec::new(),
                leader_commit: LogIndex::ZERO,
            })
            .await;
        assert!(response.success);
        assert_eq!(t.node.state, Role::Follower);
        assert_eq!(t.node.leader_id, Some(NodeId::new("n2")));
    }
}
