//! Per-follower replication workers.
//!
//! One worker task per peer while the local node leads. A worker owns its
//! peer's `next_index`, publishes `match_index` through an atomic, and
//! reports everything else (unreachability, higher terms, completed
//! catch-up rounds) over a channel the leader drains. AppendEntries to a
//! given peer are strictly serialized by construction.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::{random_timeout, RaftConfig};
use crate::error::RaftError;
use crate::membership::{ClusterConfig, Node};
use crate::storage::Storage;
use crate::transport::RaftTransport;
use crate::types::*;

const FAILURE_WAIT: Duration = Duration::from_millis(10);
const MAX_FAILURE_SCALE: u64 = 12;

/// Exponential backoff for RPC retries: 10 ms doubled per failure past the
/// second, capped at scale 12.
pub(crate) fn backoff(round: u64) -> Duration {
    let mut base = FAILURE_WAIT;
    let mut power = round.min(MAX_FAILURE_SCALE);
    while power > 2 {
        base *= 2;
        power -= 1;
    }
    base
}

/// What the leader pushes to its workers. Latest value wins; a worker that
/// missed intermediate updates only ever needs the newest.
#[derive(Debug, Clone)]
pub(crate) struct LeaderUpdate {
    pub last_index: LogIndex,
    pub commit_index: LogIndex,
    pub config: Option<ClusterConfig>,
}

/// One catch-up round of a nonvoter: from starting index to the leader's
/// last index at round start. Promotion requires a round that finished
/// quickly with nothing left behind.
#[derive(Debug, Clone)]
pub struct Round {
    pub ordinal: u64,
    pub start: Instant,
    pub target: LogIndex,
}

impl Round {
    fn new(ordinal: u64, target: LogIndex) -> Self {
        Self {
            ordinal,
            start: Instant::now(),
            target,
        }
    }

    pub fn duration(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Worker-to-leader notifications.
pub(crate) enum ReplEvent {
    /// `match_index` moved; the new value is in the shared atomic.
    MatchUpdated { peer: NodeId },
    /// Reachability flipped: `since` is set on loss, `None` on recovery.
    NoContact {
        peer: NodeId,
        since: Option<Instant>,
        error: Option<String>,
    },
    /// A response carried a higher term; the leader must step down.
    NewTerm { term: Term },
    /// A nonvoter finished a catch-up round.
    RoundCompleted { peer: NodeId, round: Round },
}

/// Leader-side handle to one replication worker.
pub(crate) struct Worker {
    pub node: Node,
    pub match_index: Arc<AtomicU64>,
    pub no_contact: Arc<Mutex<Option<Instant>>>,
    pub update_tx: watch::Sender<LeaderUpdate>,
    /// Dropping the sender (dropping the Worker) stops the task.
    _stop_tx: broadcast::Sender<()>,
    /// Highest completed round the leader has acknowledged.
    pub rounds: u64,
}

impl Worker {
    pub fn match_index(&self) -> u64 {
        self.match_index.load(Ordering::Acquire)
    }

    /// `None` means currently reachable (or never contacted).
    pub fn no_contact_since(&self) -> Option<Instant> {
        *self.no_contact.lock()
    }
}

/// Spawn a replication worker for `peer`.
///
/// `last_index`/`commit_index` seed the worker's view of the leader's log;
/// `next_index` starts at `last_index + 1` and `match_index` at zero.
#[allow(clippy::too_many_arguments)]
pub(crate) fn start_replicator(
    peer: Node,
    leader_id: NodeId,
    term: Term,
    storage: Arc<Storage>,
    transport: Arc<dyn RaftTransport>,
    config: &RaftConfig,
    to_leader: mpsc::Sender<ReplEvent>,
    last_index: LogIndex,
    commit_index: LogIndex,
) -> (Worker, JoinHandle<()>) {
    let match_index = Arc::new(AtomicU64::new(0));
    let no_contact = Arc::new(Mutex::new(None));
    let (update_tx, update_rx) = watch::channel(LeaderUpdate {
        last_index,
        commit_index,
        config: None,
    });
    let (stop_tx, stop_rx) = broadcast::channel(1);

    let replicator = Replicator {
        peer: peer.clone(),
        leader_id,
        term,
        storage,
        transport,
        heartbeat_timeout: config.heartbeat_timeout,
        max_append_entries: config.max_append_entries as u64,
        next_index: last_index.0 + 1,
        match_index: match_index.clone(),
        no_contact: no_contact.clone(),
        update_rx,
        stop_rx,
        to_leader,
        last_index: last_index.0,
        commit_index: commit_index.0,
        round: None,
    };
    let handle = tokio::spawn(replicator.run());

    (
        Worker {
            node: peer,
            match_index,
            no_contact,
            update_tx,
            _stop_tx: stop_tx,
            rounds: 0,
        },
        handle,
    )
}

struct Replicator {
    peer: Node,
    leader_id: NodeId,
    term: Term,
    storage: Arc<Storage>,
    transport: Arc<dyn RaftTransport>,
    heartbeat_timeout: Duration,
    max_append_entries: u64,

    next_index: u64,
    match_index: Arc<AtomicU64>,
    no_contact: Arc<Mutex<Option<Instant>>>,

    update_rx: watch::Receiver<LeaderUpdate>,
    stop_rx: broadcast::Receiver<()>,
    to_leader: mpsc::Sender<ReplEvent>,

    /// Leader's last log and commit indexes as last announced.
    last_index: u64,
    commit_index: u64,

    round: Option<Round>,
}

impl Replicator {
    async fn run(mut self) {
        tracing::debug!(peer = %self.peer.id, term = %self.term, "replication worker started");
        if !self.peer.voter {
            self.round = Some(Round::new(1, LogIndex(self.last_index)));
        }

        let mut req = AppendEntriesRequest {
            term: self.term,
            leader_id: self.leader_id.clone(),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: Vec::new(),
            leader_commit: LogIndex(self.commit_index),
        };

        // Catch-up: probe backwards until the follower's log provably
        // matches ours at next_index - 1.
        let mut match_index = self.match_index.load(Ordering::Acquire);
        while match_index + 1 != self.next_index {
            if !self.fill(&mut req, self.next_index, self.next_index - 1) {
                return;
            }
            let resp = match self.retry_append_entries(&req).await {
                Some(resp) => resp,
                None => return,
            };
            if resp.success {
                match_index = req.prev_log_index.0;
                if !self.publish_match(match_index).await {
                    return;
                }
                break;
            }
            // rewind using the follower's hint
            self.next_index = (self.next_index - 1).min(resp.last_log_index.0 + 1).max(1);
        }

        loop {
            if match_index >= self.last_index {
                // caught up: sleep until the leader posts news or the
                // jittered heartbeat timer fires
                let wait = random_timeout(self.heartbeat_timeout / 10);
                tokio::select! {
                    _ = self.stop_rx.recv() => return,
                    changed = self.update_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        self.absorb_update(&mut req);
                    }
                    _ = sleep(wait) => {}
                }
            } else if self.update_rx.has_changed().unwrap_or(false) {
                self.absorb_update(&mut req);
            }

            let filled = if match_index < self.last_index {
                let max = self
                    .last_index
                    .min(self.next_index + self.max_append_entries - 1);
                self.fill(&mut req, self.next_index, max)
            } else {
                // heartbeat: no entries, prev at the match point
                self.fill(&mut req, self.next_index, self.next_index - 1)
            };
            if !filled {
                return;
            }

            let resp = match self.retry_append_entries(&req).await {
                Some(resp) => resp,
                None => return,
            };
            assert!(
                resp.success,
                "[BUG] follower {} rejected matching entries in term {}",
                self.peer.id, self.term
            );

            // only what we shipped is verified; the follower's own last
            // index may cover a stale tail from an older leader
            let sent_last = req
                .entries
                .last()
                .map(|e| e.index.0)
                .unwrap_or(req.prev_log_index.0);
            self.next_index = sent_last + 1;
            if sent_last != match_index {
                match_index = sent_last;
                if !self.publish_match(match_index).await {
                    return;
                }
            }
            if !self.check_round(match_index).await {
                return;
            }
        }
    }

    /// Send until a response arrives, backing off on transport errors.
    /// `None` means stop: shutdown, or the peer answered with a higher
    /// term (reported to the leader first).
    async fn retry_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> Option<AppendEntriesResponse> {
        let mut failures: u64 = 0;
        loop {
            match self.transport.append_entries(&self.peer, req.clone()).await {
                Ok(resp) => {
                    if !self.clear_no_contact().await {
                        return None;
                    }
                    if resp.term > req.term {
                        self.send_event(ReplEvent::NewTerm { term: resp.term }).await;
                        return None;
                    }
                    return Some(resp);
                }
                Err(err) => {
                    failures += 1;
                    if !self.mark_no_contact(&err).await {
                        return None;
                    }
                    tracing::debug!(peer = %self.peer.id, failures, error = %err, "append entries failed, backing off");
                    tokio::select! {
                        _ = self.stop_rx.recv() => return None,
                        _ = sleep(backoff(failures)) => {}
                    }
                }
            }
        }
    }

    fn absorb_update(&mut self, req: &mut AppendEntriesRequest) {
        let update = self.update_rx.borrow_and_update().clone();
        self.last_index = update.last_index.0;
        self.commit_index = update.commit_index.0;
        if let Some(config) = update.config {
            if let Some(node) = config.nodes.get(&self.peer.id) {
                self.peer = node.clone();
                if self.peer.voter {
                    self.round = None; // promoted, rounds are done
                }
            }
        }
        req.leader_commit = LogIndex(self.commit_index);
    }

    /// Build the request for `[min, max]`; false aborts the worker (a read
    /// past the compacted prefix cannot be served without a snapshot).
    fn fill(&mut self, req: &mut AppendEntriesRequest, min: u64, max: u64) -> bool {
        req.leader_commit = LogIndex(self.commit_index);
        match self
            .storage
            .fill_entries(req, LogIndex(min), LogIndex(max))
        {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(peer = %self.peer.id, min, max, error = %err, "cannot read entries for replication");
                false
            }
        }
    }

    async fn publish_match(&mut self, match_index: u64) -> bool {
        self.match_index.store(match_index, Ordering::Release);
        self.send_event(ReplEvent::MatchUpdated {
            peer: self.peer.id.clone(),
        })
        .await
    }

    async fn check_round(&mut self, match_index: u64) -> bool {
        let round = match &self.round {
            Some(round) if match_index >= round.target.0 => round.clone(),
            _ => return true,
        };
        // completed: report it. With entries still pending a fresh round
        // begins; otherwise the same round is re-sent on the heartbeat
        // cadence as a promotion reminder (the leader dedups by ordinal).
        if self.last_index > match_index {
            tracing::debug!(peer = %self.peer.id, ordinal = round.ordinal, "catch-up round completed");
            self.round = Some(Round::new(round.ordinal + 1, LogIndex(self.last_index)));
        }
        self.send_event(ReplEvent::RoundCompleted {
            peer: self.peer.id.clone(),
            round,
        })
        .await
    }

    async fn mark_no_contact(&mut self, err: &RaftError) -> bool {
        let since = {
            let mut no_contact = self.no_contact.lock();
            if no_contact.is_some() {
                return true; // already reported
            }
            let now = Instant::now();
            *no_contact = Some(now);
            now
        };
        self.send_event(ReplEvent::NoContact {
            peer: self.peer.id.clone(),
            since: Some(since),
            error: Some(err.to_string()),
        })
        .await
    }

    async fn clear_no_contact(&mut self) -> bool {
        {
            let mut no_contact = self.no_contact.lock();
            if no_contact.is_none() {
                return true;
            }
            *no_contact = None;
        }
        self.send_event(ReplEvent::NoContact {
            peer: self.peer.id.clone(),
            since: None,
            error: None,
        })
        .await
    }

    /// False when the leader is gone or stopping.
    async fn send_event(&mut self, event: ReplEvent) -> bool {
        tokio::select! {
            _ = self.stop_rx.recv() => false,
            result = self.to_leader.send(event) => result.is_ok(),
        }
    }
}

/// A leader-side worker handle with no backing task, for leader unit tests.
#[cfg(test)]
pub(crate) fn test_worker(node: Node, match_index: u64) -> Worker {
    let (update_tx, _update_rx) = watch::channel(LeaderUpdate {
        last_index: LogIndex::ZERO,
        commit_index: LogIndex::ZERO,
        config: None,
    });
    let (stop_tx, _stop_rx) = broadcast::channel(1);
    Worker {
        node,
        match_index: Arc::new(AtomicU64::new(match_index)),
        no_contact: Arc::new(Mutex::new(None)),
        update_tx,
        _stop_tx: stop_tx,
        rounds: 0,
    }
}
