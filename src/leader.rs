//! Leader role loop.
//!
//! Leadership opens with a no-op entry (the term's `start_index`) and a
//! replication worker per peer. Client entries are appended locally,
//! queued, and answered once the majority match index reaches them; the
//! commit gate `n >= start_index` guarantees the committed entry carries
//! the leader's own term. A lease timer steps the leader down when it
//! loses contact with a quorum of voters.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant as TokioInstant};

use crate::error::{RaftError, Result};
use crate::fsm::ApplyResult;
use crate::membership::{validate_change, ClusterConfig, Node};
use crate::node::{NewEntry, NodeTask, RaftNode};
use crate::replication::{start_replicator, LeaderUpdate, ReplEvent, Round, Worker};
use crate::transport::RpcMessage;
use crate::types::*;

pub(crate) struct LeaderState {
    /// First index of this term; always the term-opening noop.
    pub(crate) start_index: LogIndex,

    /// Submissions not yet committed (or, for queries and barriers, not
    /// yet due), in submission order.
    pub(crate) new_entries: VecDeque<NewEntry>,

    pub(crate) workers: HashMap<NodeId, Worker>,
    pub(crate) handles: Vec<tokio::task::JoinHandle<()>>,

    pub(crate) from_repl_tx: mpsc::Sender<ReplEvent>,
    pub(crate) from_repl_rx: mpsc::Receiver<ReplEvent>,

    pub(crate) transfer: Option<Transfer>,

    /// Set when the lease check forced the step-down; picks the error
    /// pending entries are failed with.
    pub(crate) quorum_lost: bool,
}

pub(crate) struct Transfer {
    term: Term,
    target: Option<NodeId>,
    deadline: TokioInstant,
    reply: Option<oneshot::Sender<Result<()>>>,
}

enum LeaderEvent {
    Shutdown,
    Rpc(Option<RpcMessage>),
    Entry(Option<NewEntry>),
    Task(Option<NodeTask>),
    Repl(Option<ReplEvent>),
    LeaseTick,
    TransferTimeout,
}

async fn maybe_deadline(deadline: Option<TokioInstant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl RaftNode {
    pub(crate) async fn run_leader(&mut self) {
        let mut ldr = self.leader_init().await;

        let lease = self.config.leader_lease_timeout;
        let mut lease_timer = interval_at(TokioInstant::now() + lease, lease);

        while self.state == Role::Leader && !self.shutting_down {
            let transfer_deadline = ldr.transfer.as_ref().map(|t| t.deadline);
            let event = tokio::select! {
                _ = self.shutdown_rx.recv() => LeaderEvent::Shutdown,
                msg = self.rpc_rx.recv() => LeaderEvent::Rpc(msg),
                ne = self.entry_rx.recv() => LeaderEvent::Entry(ne),
                task = self.task_rx.recv() => LeaderEvent::Task(task),
                ev = ldr.from_repl_rx.recv() => LeaderEvent::Repl(ev),
                _ = lease_timer.tick() => LeaderEvent::LeaseTick,
                _ = maybe_deadline(transfer_deadline) => LeaderEvent::TransferTimeout,
            };

            match event {
                LeaderEvent::Shutdown => self.shutting_down = true,
                LeaderEvent::Rpc(Some(msg)) => self.reply_rpc(msg).await,
                LeaderEvent::Entry(Some(ne)) => self.store_entry(&mut ldr, ne).await,
                LeaderEvent::Task(Some(task)) => {
                    if let Some(task) = self.handle_common_task(task) {
                        self.handle_leader_task(&mut ldr, task).await;
                    }
                }
                LeaderEvent::Repl(Some(event)) => self.on_repl_events(&mut ldr, event).await,
                LeaderEvent::LeaseTick => self.check_quorum(&mut ldr),
                LeaderEvent::TransferTimeout => self.on_transfer_timeout(&mut ldr),
                LeaderEvent::Repl(None) => unreachable!("[BUG] leader holds a sender"),
                LeaderEvent::Rpc(None)
                | LeaderEvent::Entry(None)
                | LeaderEvent::Task(None) => self.shutting_down = true,
            }
        }

        self.leader_release(ldr).await;
    }

    async fn leader_init(&mut self) -> LeaderState {
        assert_eq!(
            self.leader_id.as_ref(),
            Some(&self.id),
            "[BUG] entering leader loop without leadership"
        );
        tracing::info!(id = %self.id, term = %self.term, "assuming leadership");

        let peers: Vec<Node> = self
            .membership
            .latest
            .nodes
            .values()
            .filter(|n| n.id != self.id)
            .cloned()
            .collect();

        let (from_repl_tx, from_repl_rx) =
            mpsc::channel((self.membership.latest.nodes.len() * 2).max(2));
        let mut ldr = LeaderState {
            start_index: self.last_log_index.next(),
            new_entries: VecDeque::new(),
            workers: HashMap::new(),
            handles: Vec::new(),
            from_repl_tx,
            from_repl_rx,
            transfer: None,
            quorum_lost: false,
        };

        // One parallel, non-retrying heartbeat before the workers exist, to
        // surface an immediate term conflict. Workers are spawned after, so
        // AppendEntries to a peer stay serialized.
        let first_beat = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id.clone(),
            prev_log_index: self.last_log_index,
            prev_log_term: self.last_log_term,
            entries: Vec::new(),
            leader_commit: self.commit_index,
        };
        let responses = futures::future::join_all(peers.iter().map(|peer| {
            let transport = self.transport.clone();
            let req = first_beat.clone();
            async move { transport.append_entries(peer, req).await }
        }))
        .await;
        for response in responses.into_iter().flatten() {
            if response.term > self.term {
                tracing::info!(id = %self.id, their_term = %response.term, "deposed before first heartbeat");
                self.set_state(Role::Follower);
                self.leader_id = None;
                self.set_term(response.term);
                return ldr;
            }
        }

        for peer in &peers {
            self.spawn_worker(&mut ldr, peer.clone());
        }

        // blank entry opening the term
        self.store_entry(&mut ldr, NewEntry::new(EntryKind::Noop, Bytes::new(), None))
            .await;
        ldr
    }

    fn spawn_worker(&mut self, ldr: &mut LeaderState, peer: Node) {
        debug_assert_ne!(peer.id, self.id, "[BUG] leader replicating to itself");
        let (worker, handle) = start_replicator(
            peer,
            self.id.clone(),
            self.term,
            self.storage.clone(),
            self.transport.clone(),
            &self.config,
            ldr.from_repl_tx.clone(),
            self.last_log_index,
            self.commit_index,
        );
        ldr.handles.push(handle);
        ldr.workers.insert(worker.node.id.clone(), worker);
    }

    /// Append path for client submissions (and the term-opening noop).
    pub(crate) async fn store_entry(&mut self, ldr: &mut LeaderState, mut ne: NewEntry) {
        ne.index = self.last_log_index.next();
        ne.term = self.term;

        if matches!(ne.kind, EntryKind::Query | EntryKind::Barrier) {
            // non-log entries ride the queue at their pseudo-index
            ldr.new_entries.push_back(ne);
            self.apply_committed(Some(&mut ldr.new_entries)).await;
            return;
        }

        if ldr.transfer.is_some() {
            ne.reply(Err(RaftError::InProgress("transferLeadership")));
            return;
        }

        let entry = Entry::new(ne.kind, ne.index, ne.term, ne.data.clone());
        if let Err(err) = self.storage.append_entry(&entry) {
            // fatal: stop accepting writes and park until an operator looks
            tracing::error!(id = %self.id, error = %err, "log append failed, stepping down");
            self.trace_error(&err);
            self.append_err = Some(err.to_string());
            ldr.new_entries.push_back(ne); // answered in release
            self.set_state(Role::Follower);
            self.leader_id = None;
            return;
        }
        tracing::debug!(id = %self.id, kind = %entry.kind, index = %entry.index, "appended");
        self.last_log_index = entry.index;
        self.last_log_term = entry.term;

        let is_config = entry.kind == EntryKind::Config;
        if is_config {
            let config = ClusterConfig::from_entry(&entry)
                .unwrap_or_else(|err| panic!("[BUG] decoding stored config entry: {err}"));
            self.set_latest_config(config);
        }

        ldr.new_entries.push_back(ne);
        self.notify_workers(ldr, is_config);
        self.advance_commit(ldr).await;
    }

    fn notify_workers(&mut self, ldr: &mut LeaderState, include_config: bool) {
        let update = LeaderUpdate {
            last_index: self.last_log_index,
            commit_index: self.commit_index,
            config: include_config.then(|| self.membership.latest.clone()),
        };
        for worker in ldr.workers.values() {
            worker.update_tx.send_replace(update.clone());
        }
    }

    /// Quorum-th largest of `{self.last_log_index} ∪ {voter match indexes}`.
    fn majority_match_index(&self, ldr: &LeaderState) -> u64 {
        let mut matched: Vec<u64> = Vec::with_capacity(self.membership.latest.num_voters());
        for node in self.membership.latest.voters() {
            if node.id == self.id {
                matched.push(self.last_log_index.0);
            } else {
                matched.push(ldr.workers.get(&node.id).map_or(0, |w| w.match_index()));
            }
        }
        if matched.is_empty() {
            return 0;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched[matched.len() / 2]
    }

    /// Advance the commit index to the majority match, gated on
    /// `start_index`: the noop there carries this term, so committing at
    /// or past it never commits a stale-term entry by counting alone.
    pub(crate) async fn advance_commit(&mut self, ldr: &mut LeaderState) {
        let n = self.majority_match_index(ldr);
        if n > self.commit_index.0 && n >= ldr.start_index.0 {
            self.set_commit_index(LogIndex(n));
            self.apply_committed(Some(&mut ldr.new_entries)).await;
            self.notify_workers(ldr, false);
        }
    }

    /// Drain the worker event channel, coalescing match updates into a
    /// single commit check.
    async fn on_repl_events(&mut self, ldr: &mut LeaderState, first: ReplEvent) {
        let mut match_updated = false;
        let mut event = Some(first);
        while let Some(ev) = event {
            match ev {
                ReplEvent::MatchUpdated { .. } => match_updated = true,
                ReplEvent::NoContact { peer, since, error } => {
                    match since {
                        Some(_) => {
                            tracing::warn!(id = %self.id, peer = %peer, error = ?error, "peer unreachable")
                        }
                        None => tracing::info!(id = %self.id, peer = %peer, "peer reachable again"),
                    }
                    if let Some(f) = &self.trace.unreachable {
                        f(&self.info(), &peer, since, error.as_deref());
                    }
                }
                ReplEvent::NewTerm { term } => {
                    tracing::info!(id = %self.id, new_term = %term, "higher term seen, stepping down");
                    self.set_state(Role::Follower);
                    self.leader_id = None;
                    self.set_term(term);
                    return;
                }
                ReplEvent::RoundCompleted { peer, round } => {
                    self.on_round_completed(ldr, peer, round).await
                }
            }
            event = ldr.from_repl_rx.try_recv().ok();
        }

        if match_updated {
            self.advance_commit(ldr).await;
            if self.state == Role::Leader
                && ldr.transfer.as_ref().map_or(false, |t| t.target.is_none())
            {
                self.try_transfer_target(ldr);
            }
        }
    }

    /// Promotion check: a nonvoter flagged `promote` becomes a voter once
    /// a round finishes under the threshold with nothing left to send.
    async fn on_round_completed(&mut self, ldr: &mut LeaderState, peer: NodeId, round: Round) {
        let match_index = {
            let Some(worker) = ldr.workers.get_mut(&peer) else {
                return;
            };
            if round.ordinal > worker.rounds {
                worker.rounds = round.ordinal;
                tracing::info!(id = %self.id, peer = %peer, ordinal = round.ordinal,
                    took_ms = round.duration().as_millis() as u64, "catch-up round completed");
                if let Some(f) = &self.trace.round_completed {
                    f(&self.info(), &peer, &round);
                }
            }
            worker.match_index()
        };

        if ldr.transfer.is_some() {
            return;
        }
        if !self.membership.is_committed() || self.commit_index < ldr.start_index {
            return;
        }
        let has_new_entries = self.last_log_index.0 > match_index;
        if has_new_entries && round.duration() > self.config.promote_threshold {
            return; // catch the next round
        }
        match self.membership.latest.node(&peer) {
            Some(node) if !node.voter && node.promote => {}
            _ => return,
        }

        tracing::info!(id = %self.id, peer = %peer, "promoting to voter");
        if let Some(f) = &self.trace.promoting {
            f(&self.info(), &peer, round.ordinal);
        }
        let mut config = self.membership.latest.clone();
        if let Some(node) = config.nodes.get_mut(&peer) {
            node.voter = true;
            node.promote = false;
        }
        self.store_config(ldr, config, None).await;
    }

    /// Store a config entry and reconcile the worker set with it.
    async fn store_config(
        &mut self,
        ldr: &mut LeaderState,
        config: ClusterConfig,
        reply: Option<oneshot::Sender<Result<ApplyResult>>>,
    ) {
        let data = match bincode::serialize(&config.nodes) {
            Ok(data) => Bytes::from(data),
            Err(err) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err.into()));
                }
                return;
            }
        };
        let ne = NewEntry::new(EntryKind::Config, data, reply);
        self.store_entry(ldr, ne).await;
        if self.state != Role::Leader {
            return; // append failed
        }

        let removed: Vec<NodeId> = ldr
            .workers
            .keys()
            .filter(|id| !self.membership.latest.nodes.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            tracing::info!(id = %self.id, peer = %id, "stopping replication to removed node");
            ldr.workers.remove(&id); // dropping the handle stops the task
        }
        let added: Vec<Node> = self
            .membership
            .latest
            .nodes
            .values()
            .filter(|n| n.id != self.id && !ldr.workers.contains_key(&n.id))
            .cloned()
            .collect();
        for node in added {
            tracing::info!(id = %self.id, peer = %node.id, "starting replication to new node");
            self.spawn_worker(ldr, node);
        }
    }

    async fn handle_leader_task(&mut self, ldr: &mut LeaderState, task: NodeTask) {
        match task {
            NodeTask::ChangeConfig { new, reply } => {
                if let Err(err) = self.validate_config_change(ldr, &new) {
                    let _ = reply.send(Err(err));
                    return;
                }
                self.store_config(ldr, new, Some(reply)).await;
            }
            NodeTask::TransferLeadership { timeout, reply } => {
                self.handle_transfer(ldr, timeout, reply);
            }
            _ => unreachable!("[BUG] common tasks are handled before dispatch"),
        }
    }

    fn validate_config_change(&self, ldr: &LeaderState, new: &ClusterConfig) -> Result<()> {
        if ldr.transfer.is_some() {
            return Err(RaftError::InProgress("transferLeadership"));
        }
        if !self.membership.is_committed() {
            return Err(RaftError::ConfigChangeInProgress);
        }
        if self.commit_index < ldr.start_index {
            return Err(RaftError::NotCommitReady);
        }
        if new.index != self.membership.latest.index {
            return Err(RaftError::ConfigChanged);
        }
        validate_change(&self.membership.latest, new)
    }

    fn handle_transfer(
        &mut self,
        ldr: &mut LeaderState,
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if ldr.transfer.is_some() {
            let _ = reply.send(Err(RaftError::InProgress("transferLeadership")));
            return;
        }
        tracing::info!(id = %self.id, term = %self.term, "transferring leadership");
        ldr.transfer = Some(Transfer {
            term: self.term,
            target: None,
            deadline: TokioInstant::now() + timeout,
            reply: Some(reply),
        });
        self.try_transfer_target(ldr);
    }

    /// Hand off to the most caught-up voter, once one exists.
    fn try_transfer_target(&mut self, ldr: &mut LeaderState) {
        match &ldr.transfer {
            Some(transfer) if transfer.target.is_none() => {}
            _ => return,
        }
        let target = self
            .membership
            .latest
            .voters()
            .filter(|n| n.id != self.id)
            .find(|n| {
                ldr.workers
                    .get(&n.id)
                    .map_or(false, |w| w.match_index() == self.last_log_index.0)
            })
            .cloned();
        let Some(node) = target else { return };

        tracing::info!(id = %self.id, target = %node.id, "sending timeout-now");
        if let Some(transfer) = ldr.transfer.as_mut() {
            transfer.target = Some(node.id.clone());
        }
        let transport = self.transport.clone();
        let request = TimeoutNowRequest {
            term: self.term,
            leader_id: self.id.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = transport.timeout_now(&node, request).await {
                tracing::warn!(target = %node.id, error = %err, "timeout-now failed");
            }
        });
    }

    fn on_transfer_timeout(&mut self, ldr: &mut LeaderState) {
        if let Some(mut transfer) = ldr.transfer.take() {
            tracing::warn!(id = %self.id, "leadership transfer timed out");
            if let Some(reply) = transfer.reply.take() {
                let _ = reply.send(Err(RaftError::Timeout("transferLeadership")));
            }
        }
    }

    /// Lease check: step down when a quorum of voters has been out of
    /// contact for the whole lease window.
    fn check_quorum(&mut self, ldr: &mut LeaderState) {
        let now = Instant::now();
        let mut voters = 0usize;
        let mut reachable = 0usize;
        for node in self.membership.latest.voters() {
            voters += 1;
            if node.id == self.id {
                reachable += 1;
                continue;
            }
            if let Some(worker) = ldr.workers.get(&node.id) {
                match worker.no_contact_since() {
                    None => reachable += 1,
                    Some(since) => {
                        if now.duration_since(since) < self.config.leader_lease_timeout {
                            reachable += 1;
                        }
                    }
                }
            }
        }
        if reachable < voters / 2 + 1 {
            tracing::warn!(id = %self.id, reachable, voters, "quorum unreachable, stepping down");
            if let Some(f) = &self.trace.quorum_unreachable {
                f(&self.info());
            }
            ldr.quorum_lost = true;
            self.set_state(Role::Follower);
            self.leader_id = None;
        }
    }

    async fn leader_release(&mut self, mut ldr: LeaderState) {
        if let Some(mut transfer) = ldr.transfer.take() {
            let result = if self.term > transfer.term {
                Ok(())
            } else if self.shutting_down {
                Err(RaftError::ServerClosed)
            } else {
                Err(RaftError::QuorumUnreachable)
            };
            if let Some(reply) = transfer.reply.take() {
                let _ = reply.send(result);
            }
        }

        // an uncommitted config was only ever provisional
        if !self.membership.is_committed() && self.membership.latest.index > self.commit_index {
            self.revert_config();
        }

        ldr.workers.clear(); // drops stop senders, workers wind down

        if self.leader_id.as_ref() == Some(&self.id) {
            self.leader_id = None;
        }

        for ne in ldr.new_entries.drain(..) {
            let err = if self.shutting_down {
                RaftError::ServerClosed
            } else if let Some(reason) = &self.append_err {
                RaftError::Storage {
                    reason: reason.clone(),
                }
            } else if ldr.quorum_lost {
                RaftError::QuorumUnreachable
            } else {
                self.not_leader_error()
            };
            ne.reply(Err(err));
        }

        for handle in ldr.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!(id = %self.id, term = %self.term, "leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Membership;
    use crate::node::tests::test_node;
    use crate::replication::test_worker;

    fn voters_config(ids: &[&str]) -> ClusterConfig {
        let nodes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| Node::voter(*id, format!("127.0.0.1:70{:02}", i + 1)))
            .collect();
        ClusterConfig::new(nodes, LogIndex(1), Term(1))
    }

    fn test_leader_state(start_index: u64) -> LeaderState {
        let (from_repl_tx, from_repl_rx) = mpsc::channel(8);
        LeaderState {
            start_index: LogIndex(start_index),
            new_entries: VecDeque::new(),
            workers: HashMap::new(),
            handles: Vec::new(),
            from_repl_tx,
            from_repl_rx,
            transfer: None,
            quorum_lost: false,
        }
    }

    fn entry(kind: EntryKind, index: u64, term: u64) -> Entry {
        Entry::new(kind, LogIndex(index), Term(term), Bytes::from("e"))
    }

    #[tokio::test]
    async fn commit_waits_for_an_entry_from_the_current_term() {
        let mut t = test_node("n1");
        let node = &mut t.node;

        // log carries entries from older terms only
        node.storage
            .append_entry(&entry(EntryKind::Command, 1, 1))
            .unwrap();
        node.storage
            .append_entry(&entry(EntryKind::Command, 2, 2))
            .unwrap();
        node.last_log_index = LogIndex(2);
        node.last_log_term = Term(2);
        node.set_term(Term(4));
        node.leader_id = Some(node.id.clone());
        node.set_state(Role::Leader);

        let config = voters_config(&["n1", "n2", "n3"]);
        node.membership = Membership {
            committed: config.clone(),
            latest: config,
        };

        let mut ldr = test_leader_state(3);
        ldr.workers.insert(
            NodeId::new("n2"),
            test_worker(Node::voter("n2", "127.0.0.1:7002"), 2),
        );
        ldr.workers.insert(
            NodeId::new("n3"),
            test_worker(Node::voter("n3", "127.0.0.1:7003"), 2),
        );

        // entry 2 sits on every node, but it is from term 2: counting it
        // alone must not commit it
        node.advance_commit(&mut ldr).await;
        assert_eq!(node.commit_index, LogIndex::ZERO);

        // the term-4 noop lands and reaches one follower: majority at 3,
        // which carries term 4 and drags entry 2 along
        node.storage
            .append_entry(&entry(EntryKind::Noop, 3, 4))
            .unwrap();
        node.last_log_index = LogIndex(3);
        node.last_log_term = Term(4);
        ldr.workers
            .get(&NodeId::new("n2"))
            .unwrap()
            .match_index
            .store(3, std::sync::atomic::Ordering::Release);

        node.advance_commit(&mut ldr).await;
        assert_eq!(node.commit_index, LogIndex(3));
        assert_eq!(node.last_applied, LogIndex(3));

        // both commands reached the fsm, in order; the noop did not
        let first = t.fsm_rx.recv().await.unwrap();
        assert_eq!(first.index, LogIndex(1));
        let second = t.fsm_rx.recv().await.unwrap();
        assert_eq!(second.index, LogIndex(2));
        assert!(t.fsm_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn majority_match_counts_voters_only() {
        let mut t = test_node("n1");
        let node = &mut t.node;
        node.last_log_index = LogIndex(10);

        let mut config = voters_config(&["n1", "n2", "n3"]);
        config.nodes.insert(
            NodeId::new("n4"),
            Node::nonvoter("n4", "127.0.0.1:7004", false),
        );
        node.membership = Membership {
            committed: config.clone(),
            latest: config,
        };

        let mut ldr = test_leader_state(1);
        ldr.workers.insert(
            NodeId::new("n2"),
            test_worker(Node::voter("n2", "127.0.0.1:7002"), 4),
        );
        ldr.workers.insert(
            NodeId::new("n3"),
            test_worker(Node::voter("n3", "127.0.0.1:7003"), 2),
        );
        // far ahead, but a nonvoter: must not drag the majority up
        ldr.workers.insert(
            NodeId::new("n4"),
            test_worker(Node::nonvoter("n4", "127.0.0.1:7004", false), 10),
        );

        // voters: self=10, n2=4, n3=2 -> quorum-th largest is 4
        assert_eq!(node.majority_match_index(&ldr), 4);
    }

    #[tokio::test]
    async fn quorum_check_steps_down_when_peers_dark() {
        let mut t = test_node("n1");
        let node = &mut t.node;
        node.set_term(Term(2));
        node.leader_id = Some(node.id.clone());
        node.set_state(Role::Leader);
        node.config.leader_lease_timeout = Duration::from_millis(1);

        let config = voters_config(&["n1", "n2", "n3"]);
        node.membership = Membership {
            committed: config.clone(),
            latest: config,
        };

        let mut ldr = test_leader_state(1);
        let w2 = test_worker(Node::voter("n2", "127.0.0.1:7002"), 0);
        let w3 = test_worker(Node::voter("n3", "127.0.0.1:7003"), 0);
        *w2.no_contact.lock() = Some(Instant::now());
        *w3.no_contact.lock() = Some(Instant::now());
        ldr.workers.insert(NodeId::new("n2"), w2);
        ldr.workers.insert(NodeId::new("n3"), w3);

        // let the 1 ms lease lapse with both peers dark
        tokio::time::sleep(Duration::from_millis(20)).await;
        node.check_quorum(&mut ldr);
        assert_eq!(node.state, Role::Follower);
        assert_eq!(node.leader_id, None);

        // release answers nothing since the queue is empty
        node.leader_release(ldr).await;
    }
}
